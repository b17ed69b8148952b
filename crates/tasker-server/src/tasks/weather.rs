//! Current weather for a city via Open-Meteo.
//!
//! Two calls per execution: geocode the city name, then fetch current
//! conditions at the resolved coordinates. Open-Meteo needs no API key.

use std::time::Instant;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use tasker_core::Parameters;

use super::{classify_request_error, classify_status, required_text};
use crate::config::ExternalApiConfig;
use crate::metrics::Metrics;
use crate::registry::{HandlerError, ValidationError};

const TASK: &str = "weather";
const API: &str = "open_meteo";
const API_NAME: &str = "Open-Meteo";

const CURRENT_FIELDS: &str = "temperature_2m,relative_humidity_2m,apparent_temperature,\
weather_code,cloud_cover,pressure_msl,wind_speed_10m,wind_direction_10m";

/// Unit system for reported values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Units {
    #[default]
    Metric,
    Imperial,
    Kelvin,
}

impl Units {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::Imperial => "imperial",
            Self::Kelvin => "kelvin",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "metric" => Some(Self::Metric),
            "imperial" => Some(Self::Imperial),
            "kelvin" => Some(Self::Kelvin),
            _ => None,
        }
    }

    // Open-Meteo has no kelvin; it is converted from celsius afterwards.
    fn temperature_unit(&self) -> &'static str {
        match self {
            Self::Metric | Self::Kelvin => "celsius",
            Self::Imperial => "fahrenheit",
        }
    }

    fn wind_speed_unit(&self) -> &'static str {
        match self {
            Self::Metric => "kmh",
            Self::Imperial => "mph",
            Self::Kelvin => "ms",
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Option<Vec<Location>>,
}

#[derive(Debug, Deserialize)]
struct Location {
    latitude: f64,
    longitude: f64,
    name: Option<String>,
    country_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    #[serde(default)]
    current: CurrentConditions,
    timezone: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CurrentConditions {
    temperature_2m: Option<f64>,
    relative_humidity_2m: Option<f64>,
    apparent_temperature: Option<f64>,
    weather_code: Option<i64>,
    cloud_cover: Option<f64>,
    pressure_msl: Option<f64>,
    wind_speed_10m: Option<f64>,
    wind_direction_10m: Option<f64>,
}

/// Fetches current weather for parameter `city`.
#[derive(Debug, Clone)]
pub struct WeatherTask {
    client: reqwest::Client,
    geocoding_url: String,
    forecast_url: String,
    max_city_length: usize,
}

impl WeatherTask {
    pub fn new(client: reqwest::Client, external: &ExternalApiConfig, max_city_length: usize) -> Self {
        Self {
            client,
            geocoding_url: external.geocoding_url.clone(),
            forecast_url: external.forecast_url.clone(),
            max_city_length,
        }
    }

    pub fn validate(&self, parameters: &Parameters) -> Result<(), ValidationError> {
        self.inputs(parameters).map(|_| ())
    }

    pub async fn execute(
        &self,
        parameters: &Parameters,
        metrics: &Metrics,
    ) -> Result<Value, HandlerError> {
        let (city, units) = self.inputs(parameters)?;
        info!(city, units = units.as_str(), "Weather request started");

        let started = Instant::now();
        let result = self.fetch(city, units).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => {
                metrics.record_external_call(API, "success", elapsed);
                info!(city, duration_ms = elapsed.as_millis() as u64, "Weather request completed");
            }
            Err((status, e)) => {
                metrics.record_external_call(API, status, elapsed);
                warn!(city, error = %e, duration_ms = elapsed.as_millis() as u64, "Weather request failed");
            }
        }
        result.map_err(|(_, e)| e)
    }

    fn inputs<'a>(&self, parameters: &'a Parameters) -> Result<(&'a str, Units), ValidationError> {
        let city = required_text(parameters, "city", TASK, self.max_city_length)?;
        if !city.chars().all(is_city_char) {
            return Err(ValidationError::new(
                "city",
                "Parameter 'city' contains invalid characters",
            ));
        }

        let units = match parameters.get("units") {
            None | Some(Value::Null) => Units::default(),
            Some(value) => value.as_str().and_then(Units::parse).ok_or_else(|| {
                ValidationError::new(
                    "units",
                    "Parameter 'units' must be 'metric', 'imperial', or 'kelvin'",
                )
            })?,
        };
        Ok((city, units))
    }

    async fn fetch(&self, city: &str, units: Units) -> Result<Value, (&'static str, HandlerError)> {
        let location = self.geocode(city).await?;

        let response = self
            .client
            .get(&self.forecast_url)
            .query(&[
                ("latitude", location.latitude.to_string()),
                ("longitude", location.longitude.to_string()),
                ("current", CURRENT_FIELDS.to_string()),
                ("temperature_unit", units.temperature_unit().to_string()),
                ("wind_speed_unit", units.wind_speed_unit().to_string()),
                ("timezone", "auto".to_string()),
            ])
            .send()
            .await
            .map_err(|e| classify_request_error(API_NAME, &e))?;

        if !response.status().is_success() {
            return Err(("error", classify_status(API_NAME, response.status())));
        }
        let forecast: ForecastResponse = response
            .json()
            .await
            .map_err(|e| classify_request_error(API_NAME, &e))?;

        Ok(render(city, &location, &forecast, units))
    }

    async fn geocode(&self, city: &str) -> Result<Location, (&'static str, HandlerError)> {
        let response = self
            .client
            .get(&self.geocoding_url)
            .query(&[("name", city), ("count", "1"), ("language", "en"), ("format", "json")])
            .send()
            .await
            .map_err(|e| classify_request_error(API_NAME, &e))?;

        if !response.status().is_success() {
            return Err(("error", classify_status(API_NAME, response.status())));
        }
        let geocoding: GeocodingResponse = response
            .json()
            .await
            .map_err(|e| classify_request_error(API_NAME, &e))?;

        geocoding
            .results
            .and_then(|results| results.into_iter().next())
            .ok_or_else(|| {
                (
                    "not_found",
                    HandlerError::InvalidInput(format!("City '{city}' not found")),
                )
            })
    }
}

fn is_city_char(c: char) -> bool {
    c.is_alphanumeric() || c.is_whitespace() || matches!(c, '_' | '-' | '.' | ',' | '\'')
}

fn render(city: &str, location: &Location, forecast: &ForecastResponse, units: Units) -> Value {
    let current = &forecast.current;
    let (main, description, icon) = describe(current.weather_code.unwrap_or(0));

    let temperature = |t: Option<f64>| match units {
        Units::Kelvin => t.map(to_kelvin),
        _ => t,
    };

    json!({
        "city": location.name.as_deref().unwrap_or(city),
        "country": location.country_code.as_deref().unwrap_or(""),
        "coordinates": {
            "latitude": location.latitude,
            "longitude": location.longitude,
        },
        "weather": {
            "main": main,
            "description": description,
            "icon": icon,
        },
        "temperature": {
            "current": temperature(current.temperature_2m),
            "feels_like": temperature(current.apparent_temperature),
            "min": null,
            "max": null,
            "units": units.as_str(),
        },
        "humidity": current.relative_humidity_2m,
        "pressure": current.pressure_msl,
        "wind": {
            "speed": current.wind_speed_10m,
            "direction": current.wind_direction_10m,
        },
        "visibility": null,
        "clouds": current.cloud_cover,
        "timezone": forecast.timezone,
    })
}

fn to_kelvin(celsius: f64) -> f64 {
    ((celsius + 273.15) * 100.0).round() / 100.0
}

/// WMO weather interpretation code to (main, description, icon).
fn describe(code: i64) -> (&'static str, &'static str, &'static str) {
    match code {
        0 => ("Clear", "Clear sky", "☀️"),
        1 => ("Mainly Clear", "Mainly clear", "🌤️"),
        2 => ("Partly Cloudy", "Partly cloudy", "⛅"),
        3 => ("Overcast", "Overcast", "☁️"),
        45 => ("Fog", "Fog", "🌫️"),
        48 => ("Fog", "Depositing rime fog", "🌫️"),
        51 => ("Drizzle", "Light drizzle", "🌧️"),
        53 => ("Drizzle", "Moderate drizzle", "🌧️"),
        55 => ("Drizzle", "Dense drizzle", "🌧️"),
        56 => ("Freezing Drizzle", "Light freezing drizzle", "🌧️"),
        57 => ("Freezing Drizzle", "Dense freezing drizzle", "🌧️"),
        61 => ("Rain", "Slight rain", "🌧️"),
        63 => ("Rain", "Moderate rain", "🌧️"),
        65 => ("Rain", "Heavy rain", "🌧️"),
        66 => ("Freezing Rain", "Light freezing rain", "🌧️"),
        67 => ("Freezing Rain", "Heavy freezing rain", "🌧️"),
        71 => ("Snow", "Slight snowfall", "🌨️"),
        73 => ("Snow", "Moderate snowfall", "🌨️"),
        75 => ("Snow", "Heavy snowfall", "🌨️"),
        77 => ("Snow", "Snow grains", "🌨️"),
        80 => ("Rain Showers", "Slight rain showers", "🌦️"),
        81 => ("Rain Showers", "Moderate rain showers", "🌦️"),
        82 => ("Rain Showers", "Violent rain showers", "🌦️"),
        85 => ("Snow Showers", "Slight snow showers", "🌨️"),
        86 => ("Snow Showers", "Heavy snow showers", "🌨️"),
        95 => ("Thunderstorm", "Thunderstorm", "⛈️"),
        96 => ("Thunderstorm", "Thunderstorm with slight hail", "⛈️"),
        99 => ("Thunderstorm", "Thunderstorm with heavy hail", "⛈️"),
        _ => ("Unknown", "Unknown", "❓"),
    }
}
