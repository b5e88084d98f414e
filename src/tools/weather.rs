use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::ToolResult;

pub const MIN_FORECAST_DAYS: i64 = 1;
pub const MAX_FORECAST_DAYS: i64 = 7;
pub const DEFAULT_FORECAST_DAYS: i64 = 3;

pub const OPEN_METEO_GEOCODING_URL: &str = "https://geocoding-api.open-meteo.com/v1/search";
pub const OPEN_METEO_FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";
const OPEN_METEO_DAILY_FIELDS: &str =
    "temperature_2m_max,temperature_2m_min,precipitation_sum,wind_speed_10m_max";

fn default_forecast_days() -> i64 {
    DEFAULT_FORECAST_DAYS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherRequest {
    pub location: String,
    #[serde(default = "default_forecast_days")]
    pub days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyForecast {
    pub date: NaiveDate,
    pub temp_max_c: f64,
    pub temp_min_c: f64,
    pub precip_mm: f64,
    pub wind_max_kmh: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
    pub display_name: String,
    pub country: String,
}

impl GeoLocation {
    pub fn label(&self) -> String {
        if self.country.trim().is_empty() {
            self.display_name.clone()
        } else {
            format!("{}, {}", self.display_name, self.country)
        }
    }
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Option<GeoLocation>>;
}

#[async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn fetch(&self, lat: f64, lon: f64, days: u8) -> Result<Vec<DailyForecast>>;
}

/// Checks the request before any network call. Returns the trimmed location and day count.
pub fn validate_weather_request(request: &WeatherRequest) -> Result<(String, u8), String> {
    let location = request.location.trim();
    if location.is_empty() {
        return Err("Location cannot be empty.".to_string());
    }
    if !(MIN_FORECAST_DAYS..=MAX_FORECAST_DAYS).contains(&request.days) {
        return Err(format!(
            "days must be between {MIN_FORECAST_DAYS} and {MAX_FORECAST_DAYS}, got {}",
            request.days
        ));
    }
    let days = u8::try_from(request.days).map_err(|_| "days is out of range".to_string())?;
    Ok((location.to_string(), days))
}

pub async fn run_weather(
    request: &WeatherRequest,
    geocoder: &dyn Geocoder,
    forecast: &dyn ForecastProvider,
) -> ToolResult {
    let (location, days) = match validate_weather_request(request) {
        Ok(valid) => valid,
        Err(message) => return ToolResult::WeatherError { message },
    };

    let place = match geocoder.resolve(&location).await {
        Ok(Some(place)) => place,
        Ok(None) => {
            return ToolResult::WeatherError {
                message: format!("Location not found: {location}"),
            };
        }
        Err(err) => {
            return ToolResult::WeatherError {
                message: format!("Geocoding failed: {err:#}"),
            };
        }
    };
    tracing::debug!(
        location = %location,
        resolved = %place.label(),
        lat = place.lat,
        lon = place.lon,
        "geocoded weather location"
    );

    match forecast.fetch(place.lat, place.lon, days).await {
        Ok(forecast) => ToolResult::WeatherResult {
            location: place.label(),
            days,
            forecast,
        },
        Err(err) => ToolResult::WeatherError {
            message: format!("Forecast failed: {err:#}"),
        },
    }
}

#[derive(Debug, Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Vec<GeocodingPlace>,
}

#[derive(Debug, Deserialize)]
struct GeocodingPlace {
    name: String,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    country: String,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    daily: DailySeries,
}

#[derive(Debug, Deserialize)]
struct DailySeries {
    time: Vec<NaiveDate>,
    temperature_2m_max: Vec<Option<f64>>,
    temperature_2m_min: Vec<Option<f64>>,
    precipitation_sum: Vec<Option<f64>>,
    wind_speed_10m_max: Vec<Option<f64>>,
}

fn series_value(series: &[Option<f64>], index: usize, field: &str, date: NaiveDate) -> Result<f64> {
    series
        .get(index)
        .copied()
        .flatten()
        .ok_or_else(|| anyhow::anyhow!("forecast response has no {field} value for {date}"))
}

impl DailySeries {
    fn into_forecast(self) -> Result<Vec<DailyForecast>> {
        self.time
            .iter()
            .enumerate()
            .map(|(index, date)| {
                Ok(DailyForecast {
                    date: *date,
                    temp_max_c: series_value(
                        &self.temperature_2m_max,
                        index,
                        "temperature_2m_max",
                        *date,
                    )?,
                    temp_min_c: series_value(
                        &self.temperature_2m_min,
                        index,
                        "temperature_2m_min",
                        *date,
                    )?,
                    precip_mm: series_value(
                        &self.precipitation_sum,
                        index,
                        "precipitation_sum",
                        *date,
                    )?,
                    wind_max_kmh: series_value(
                        &self.wind_speed_10m_max,
                        index,
                        "wind_speed_10m_max",
                        *date,
                    )?,
                })
            })
            .collect()
    }
}

/// Open-Meteo geocoding and forecast client. Needs no API key.
#[derive(Debug, Clone)]
pub struct OpenMeteoClient {
    client: reqwest::Client,
    geocoding_url: String,
    forecast_url: String,
    geocoding_timeout: Duration,
    forecast_timeout: Duration,
}

impl OpenMeteoClient {
    pub fn new(geocoding_timeout: Duration, forecast_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("askflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build Open-Meteo HTTP client")?;
        Ok(Self {
            client,
            geocoding_url: OPEN_METEO_GEOCODING_URL.to_string(),
            forecast_url: OPEN_METEO_FORECAST_URL.to_string(),
            geocoding_timeout,
            forecast_timeout,
        })
    }

    pub fn with_base_urls(
        mut self,
        geocoding_url: impl Into<String>,
        forecast_url: impl Into<String>,
    ) -> Self {
        self.geocoding_url = geocoding_url.into();
        self.forecast_url = forecast_url.into();
        self
    }

    pub fn into_capabilities(self) -> (Arc<dyn Geocoder>, Arc<dyn ForecastProvider>) {
        let shared = Arc::new(self);
        let geocoder: Arc<dyn Geocoder> = shared.clone();
        let forecast: Arc<dyn ForecastProvider> = shared;
        (geocoder, forecast)
    }
}

#[async_trait]
impl Geocoder for OpenMeteoClient {
    async fn resolve(&self, name: &str) -> Result<Option<GeoLocation>> {
        let response = self
            .client
            .get(&self.geocoding_url)
            .query(&[("name", name), ("count", "1")])
            .timeout(self.geocoding_timeout)
            .send()
            .await
            .context("geocoding request failed")?
            .error_for_status()
            .context("geocoding service returned an error status")?;
        let body = response
            .json::<GeocodingResponse>()
            .await
            .context("failed to decode geocoding response")?;

        Ok(body.results.into_iter().next().map(|place| GeoLocation {
            lat: place.latitude,
            lon: place.longitude,
            display_name: place.name,
            country: place.country,
        }))
    }
}

#[async_trait]
impl ForecastProvider for OpenMeteoClient {
    async fn fetch(&self, lat: f64, lon: f64, days: u8) -> Result<Vec<DailyForecast>> {
        let response = self
            .client
            .get(&self.forecast_url)
            .query(&[
                ("latitude", lat.to_string()),
                ("longitude", lon.to_string()),
                ("daily", OPEN_METEO_DAILY_FIELDS.to_string()),
                ("forecast_days", days.to_string()),
                ("timezone", "auto".to_string()),
            ])
            .timeout(self.forecast_timeout)
            .send()
            .await
            .context("forecast request failed")?
            .error_for_status()
            .context("forecast service returned an error status")?;
        let body = response
            .json::<ForecastResponse>()
            .await
            .context("failed to decode forecast response")?;
        body.daily.into_forecast()
    }
}
