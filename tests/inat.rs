use std::fs;

use assert_matches::assert_matches;
use serde_json::json;

use inat_soundscan::domain::{ObservationRef, SoundAssetRef};
use inat_soundscan::error::SoundscanError;
use inat_soundscan::inat::parse_observation;

#[test]
fn parse_observation_fixture_uses_first_result() {
    let raw = fs::read_to_string("tests/fixtures/observation_332146765.json").unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let id: ObservationRef = "332146765".parse().unwrap();

    let observation = parse_observation(&id, &value).unwrap();

    assert_eq!(observation.id, id);
    assert_eq!(observation.observed_on.date().to_string(), "2025-10-10");
    let coordinates = observation.coordinates.unwrap();
    assert_eq!(coordinates.latitude, 51.5012);
    assert_eq!(coordinates.longitude, -0.1246);
    assert_eq!(
        observation.sound_assets,
        vec![
            SoundAssetRef {
                source_url: "https://static.inaturalist.org/sounds/1180001.m4a?1760101234"
                    .to_string(),
                format: "m4a".to_string(),
            },
            SoundAssetRef {
                source_url: "https://static.inaturalist.org/sounds/1180002.wav?1760101299"
                    .to_string(),
                format: "wav".to_string(),
            },
        ]
    );
}

#[test]
fn missing_results_is_malformed() {
    let id: ObservationRef = "1".parse().unwrap();
    let err = parse_observation(&id, &json!({ "total_results": 0 })).unwrap_err();
    assert_matches!(err, SoundscanError::MalformedResponse(_));

    let err = parse_observation(&id, &json!({ "results": [] })).unwrap_err();
    assert_matches!(err, SoundscanError::MalformedResponse(_));
}

#[test]
fn incomplete_date_is_malformed() {
    let id: ObservationRef = "1".parse().unwrap();
    let response = json!({
        "results": [{ "observed_on_details": { "year": 2025, "month": 10 }, "sounds": [] }]
    });
    let err = parse_observation(&id, &response).unwrap_err();
    assert_matches!(err, SoundscanError::MalformedResponse(_));

    let response = json!({
        "results": [{ "observed_on_details": null, "sounds": [] }]
    });
    let err = parse_observation(&id, &response).unwrap_err();
    assert_matches!(err, SoundscanError::MalformedResponse(_));
}

#[test]
fn absent_geojson_leaves_coordinates_empty() {
    let id: ObservationRef = "1".parse().unwrap();
    let response = json!({
        "results": [{
            "observed_on_details": { "year": 2025, "month": 10, "day": 10 },
            "geojson": null,
            "sounds": [{ "file_url": "https://static.inaturalist.org/sounds/9.mp3" }]
        }]
    });
    let observation = parse_observation(&id, &response).unwrap();
    assert!(observation.coordinates.is_none());
    assert_eq!(observation.sound_assets[0].format, "mp3");
}
