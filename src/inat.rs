use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, info};

use crate::assets::extract_sound_assets;
use crate::domain::{Coordinates, Observation, ObservationPeriod, ObservationRef};
use crate::error::SoundscanError;

pub const DEFAULT_API_BASE_URL: &str = "https://api.inaturalist.org/v1";

pub trait ObservationClient: Send + Sync {
    fn fetch_response(&self, id: &ObservationRef) -> Result<Value, SoundscanError>;
}

impl<T: ObservationClient + ?Sized> ObservationClient for &T {
    fn fetch_response(&self, id: &ObservationRef) -> Result<Value, SoundscanError> {
        (**self).fetch_response(id)
    }
}

#[derive(Clone)]
pub struct InatHttpClient {
    client: Client,
    base_url: String,
}

impl InatHttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SoundscanError> {
        let client = http_client(timeout)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn observation_url(&self, id: &ObservationRef) -> String {
        format!("{}/observations/{}", self.base_url, id.as_str())
    }
}

impl ObservationClient for InatHttpClient {
    fn fetch_response(&self, id: &ObservationRef) -> Result<Value, SoundscanError> {
        let url = self.observation_url(id);
        info!(%id, "requesting observation");
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| SoundscanError::UpstreamUnavailable(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "observation request failed".to_string());
            return Err(SoundscanError::UpstreamStatus { status, message });
        }
        let body: Value = response
            .json()
            .map_err(|err| SoundscanError::MalformedResponse(err.to_string()))?;
        info!(%id, "received observation");
        Ok(body)
    }
}

/// Shared blocking client used for both metadata and media requests.
pub fn http_client(timeout: Duration) -> Result<Client, SoundscanError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("inat-soundscan/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| SoundscanError::UpstreamUnavailable(err.to_string()))?,
    );
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|err| SoundscanError::UpstreamUnavailable(err.to_string()))
}

pub fn fetch_observation<C: ObservationClient + ?Sized>(
    client: &C,
    id: &ObservationRef,
) -> Result<Observation, SoundscanError> {
    let response = client.fetch_response(id)?;
    parse_observation(id, &response)
}

/// Builds an [`Observation`] from an `/observations/{id}` response body.
///
/// Only the first entry of `results` is used.
pub fn parse_observation(
    id: &ObservationRef,
    response: &Value,
) -> Result<Observation, SoundscanError> {
    let results = response
        .get("results")
        .and_then(|value| value.as_array())
        .ok_or_else(|| SoundscanError::MalformedResponse("missing results array".to_string()))?;
    if results.len() > 1 {
        debug!(%id, count = results.len(), "discarding extra observation results");
    }
    let result = results
        .first()
        .ok_or_else(|| SoundscanError::MalformedResponse(format!("no result for {id}")))?;

    let observed_on = parse_observed_on(result)?;
    let coordinates = parse_coordinates(result);
    let sound_assets = extract_sound_assets(result)?;

    info!(
        %id,
        date = %observed_on.date(),
        latitude = coordinates.map(|c| c.latitude),
        longitude = coordinates.map(|c| c.longitude),
        sounds = sound_assets.len(),
        "parsed observation"
    );

    Ok(Observation {
        id: id.clone(),
        coordinates,
        observed_on,
        sound_assets,
    })
}

fn parse_observed_on(result: &Value) -> Result<ObservationPeriod, SoundscanError> {
    let details = result
        .get("observed_on_details")
        .filter(|value| value.is_object())
        .ok_or_else(|| {
            SoundscanError::MalformedResponse("missing observed_on_details".to_string())
        })?;
    let field = |name: &str| {
        details
            .get(name)
            .and_then(|value| value.as_i64())
            .ok_or_else(|| {
                SoundscanError::MalformedResponse(format!("observed_on_details.{name} missing"))
            })
    };
    let year = field("year")?;
    let month = field("month")?;
    let day = field("day")?;
    let year = i32::try_from(year)
        .map_err(|_| SoundscanError::MalformedResponse(format!("year {year} out of range")))?;
    let month = u32::try_from(month)
        .map_err(|_| SoundscanError::MalformedResponse(format!("month {month} out of range")))?;
    let day = u32::try_from(day)
        .map_err(|_| SoundscanError::MalformedResponse(format!("day {day} out of range")))?;
    ObservationPeriod::from_ymd(year, month, day)
}

/// GeoJSON point order is `[lon, lat]`; anything else counts as no location.
fn parse_coordinates(result: &Value) -> Option<Coordinates> {
    let coordinates = result
        .get("geojson")
        .and_then(|value| value.get("coordinates"))
        .and_then(|value| value.as_array())?;
    if coordinates.len() != 2 {
        return None;
    }
    let lon = coordinates[0].as_f64()?;
    let lat = coordinates[1].as_f64()?;
    Coordinates::new(lat, lon).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coordinates_are_lon_lat() {
        let result = json!({ "geojson": { "type": "Point", "coordinates": [-89.4, 43.0] } });
        let coords = parse_coordinates(&result).unwrap();
        assert_eq!(coords.latitude, 43.0);
        assert_eq!(coords.longitude, -89.4);
    }

    #[test]
    fn null_geojson_is_absent() {
        let result = json!({ "geojson": null });
        assert!(parse_coordinates(&result).is_none());
        let result = json!({ "geojson": { "coordinates": ["a", "b"] } });
        assert!(parse_coordinates(&result).is_none());
    }
}
