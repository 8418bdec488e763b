//! 天气能力 Agent
//!
//! 操作：current / forecast。只读，无需幂等键。
//! Provider 实现：Nominatim 地理编码 + Open-Meteo 预报。

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::WeatherProviderSection;
use crate::tools::contract::{
    optional_u64, require_str, AgentReply, CapabilityAgent, OperationSpec, ProviderError,
};

/// WMO 天气代码描述表
pub fn describe_weather_code(code: u32) -> &'static str {
    match code {
        0 => "Clear sky",
        1 => "Mainly clear",
        2 => "Partly cloudy",
        3 => "Overcast",
        45 => "Fog",
        48 => "Depositing rime fog",
        51 => "Light drizzle",
        53 => "Moderate drizzle",
        55 => "Dense drizzle",
        61 => "Slight rain",
        63 => "Moderate rain",
        65 => "Heavy rain",
        66 => "Light freezing rain",
        67 => "Heavy freezing rain",
        71 => "Slight snow fall",
        73 => "Moderate snow fall",
        75 => "Heavy snow fall",
        77 => "Snow grains",
        80 => "Slight rain showers",
        81 => "Moderate rain showers",
        82 => "Violent rain showers",
        85 => "Slight snow showers",
        86 => "Heavy snow showers",
        95 => "Thunderstorm",
        96 => "Thunderstorm with slight hail",
        99 => "Thunderstorm with heavy hail",
        _ => "Unknown conditions",
    }
}

/// 当前天气（时间为 UTC-naive）
#[derive(Debug, Clone, Serialize)]
pub struct WeatherNow {
    pub location: String,
    pub observed_at: NaiveDateTime,
    pub temperature_c: f64,
    pub wind_kmh: f64,
    pub weather_code: u32,
    pub description: String,
    /// 当日最大降水概率（百分比）；Provider 未提供时为 None
    pub rain_probability_pct: Option<u64>,
}

/// 某日预报
#[derive(Debug, Clone, Serialize)]
pub struct WeatherDay {
    pub location: String,
    pub date: NaiveDate,
    pub temp_min_c: f64,
    pub temp_max_c: f64,
    pub precipitation_mm: f64,
    pub weather_code: u32,
    pub description: String,
    /// 当日最大降水概率（百分比）；Provider 未提供时为 None
    pub rain_probability_pct: Option<u64>,
}

/// 最多可请求的预报天数（day_offset 0..FORECAST_DAYS）
const FORECAST_DAYS: u64 = 3;

/// 天气 Provider 抽象
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn current(&self, location: &str) -> Result<WeatherNow, ProviderError>;
    async fn forecast(&self, location: &str, day_offset: u64) -> Result<WeatherDay, ProviderError>;
}

/// 天气 Agent：校验参数后委托 Provider
pub struct WeatherAgent {
    provider: std::sync::Arc<dyn WeatherProvider>,
}

impl WeatherAgent {
    pub fn new(provider: std::sync::Arc<dyn WeatherProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl CapabilityAgent for WeatherAgent {
    fn name(&self) -> &str {
        "weather"
    }

    fn description(&self) -> &str {
        "Weather information: current conditions and short-range forecasts for any city or location."
    }

    fn operations(&self) -> Vec<OperationSpec> {
        vec![
            OperationSpec {
                name: "current",
                description: "Current weather conditions for a location",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "location": {"type": "string", "description": "City name or 'lat,lon'"}
                    },
                    "required": ["location"]
                }),
                mutating: false,
            },
            OperationSpec {
                name: "forecast",
                description: "Daily forecast; day_offset 0 = today, 1 = tomorrow, 2 = day after",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "location": {"type": "string"},
                        "day_offset": {"type": "integer", "minimum": 0, "maximum": FORECAST_DAYS - 1}
                    },
                    "required": ["location"]
                }),
                mutating: false,
            },
        ]
    }

    async fn invoke(&self, operation: &str, parameters: &Value) -> Result<AgentReply, ProviderError> {
        match operation {
            "current" => {
                let location = require_str(parameters, "location")?;
                let now = self.provider.current(location).await?;
                let mut summary = format!(
                    "Current weather for {}: {:.1}°C, {}, wind {:.0} km/h",
                    now.location, now.temperature_c, now.description, now.wind_kmh
                );
                if let Some(pct) = now.rain_probability_pct {
                    summary.push_str(&format!(", {pct}% chance of rain today"));
                }
                let mut payload = serde_json::to_value(&now)
                    .map_err(|e| ProviderError::Other(e.to_string()))?;
                payload["summary"] = Value::String(summary);
                Ok(AgentReply::Complete(payload))
            }
            "forecast" => {
                let location = require_str(parameters, "location")?;
                let day_offset = optional_u64(parameters, "day_offset")?.unwrap_or(0);
                if day_offset >= FORECAST_DAYS {
                    return Err(ProviderError::InvalidInput(format!(
                        "day_offset must be below {FORECAST_DAYS}"
                    )));
                }
                let day = self.provider.forecast(location, day_offset).await?;
                let mut summary = format!(
                    "Forecast for {} on {}: {:.0}-{:.0}°C, {}, {:.1}mm precipitation",
                    day.location, day.date, day.temp_min_c, day.temp_max_c, day.description,
                    day.precipitation_mm
                );
                if let Some(pct) = day.rain_probability_pct {
                    summary.push_str(&format!(", {pct}% chance of rain"));
                }
                let mut payload = serde_json::to_value(&day)
                    .map_err(|e| ProviderError::Other(e.to_string()))?;
                payload["summary"] = Value::String(summary);
                Ok(AgentReply::Complete(payload))
            }
            other => Err(ProviderError::InvalidInput(format!(
                "unknown weather operation '{other}'"
            ))),
        }
    }
}

/// Open-Meteo + Nominatim HTTP Provider
pub struct OpenMeteoProvider {
    http: reqwest::Client,
    open_meteo_url: String,
    nominatim_url: String,
}

#[derive(Debug, Deserialize)]
struct GeocodeHit {
    lat: String,
    lon: String,
}

impl OpenMeteoProvider {
    pub fn new(cfg: &WeatherProviderSection) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .user_agent("aide-weather/0.1")
            .build()
            .unwrap_or_default();
        Self {
            http,
            open_meteo_url: cfg.open_meteo_url.clone(),
            nominatim_url: cfg.nominatim_url.clone(),
        }
    }

    fn map_http_error(e: reqwest::Error) -> ProviderError {
        if let Some(status) = e.status() {
            if status.as_u16() == 429 {
                return ProviderError::RateLimited(status.to_string());
            }
        }
        ProviderError::Unavailable(e.to_string())
    }

    /// "lat,lon" 直接解析，否则经 Nominatim 地理编码
    async fn resolve(&self, location: &str) -> Result<(f64, f64), ProviderError> {
        let parts: Vec<&str> = location.split(',').map(str::trim).collect();
        if parts.len() == 2 {
            if let (Ok(lat), Ok(lon)) = (parts[0].parse::<f64>(), parts[1].parse::<f64>()) {
                return Ok((lat, lon));
            }
        }

        let hits: Vec<GeocodeHit> = self
            .http
            .get(&self.nominatim_url)
            .query(&[("q", location), ("format", "json"), ("limit", "1")])
            .send()
            .await
            .map_err(Self::map_http_error)?
            .error_for_status()
            .map_err(Self::map_http_error)?
            .json()
            .await
            .map_err(Self::map_http_error)?;

        let hit = hits
            .first()
            .ok_or_else(|| ProviderError::NotFound(format!("could not find location '{location}'")))?;
        let lat = hit
            .lat
            .parse::<f64>()
            .map_err(|e| ProviderError::Other(e.to_string()))?;
        let lon = hit
            .lon
            .parse::<f64>()
            .map_err(|e| ProviderError::Other(e.to_string()))?;
        tracing::debug!(location, lat, lon, "geocoded");
        Ok((lat, lon))
    }

    async fn fetch(&self, lat: f64, lon: f64) -> Result<Value, ProviderError> {
        self.http
            .get(&self.open_meteo_url)
            .query(&[
                ("latitude", lat.to_string()),
                ("longitude", lon.to_string()),
                ("current_weather", "true".to_string()),
                (
                    "daily",
                    "temperature_2m_max,temperature_2m_min,precipitation_sum,precipitation_probability_max,weathercode"
                        .to_string(),
                ),
                ("forecast_days", FORECAST_DAYS.to_string()),
                ("timezone", "UTC".to_string()),
            ])
            .send()
            .await
            .map_err(Self::map_http_error)?
            .error_for_status()
            .map_err(Self::map_http_error)?
            .json()
            .await
            .map_err(Self::map_http_error)
    }
}

fn field_f64(value: &Value, path: &[&str]) -> Result<f64, ProviderError> {
    let mut cur = value;
    for key in path {
        cur = cur
            .get(key)
            .ok_or_else(|| ProviderError::Other(format!("missing '{key}' in weather response")))?;
    }
    cur.as_f64()
        .ok_or_else(|| ProviderError::Other("non-numeric weather field".to_string()))
}

fn daily_f64(value: &Value, key: &str, idx: usize) -> Result<f64, ProviderError> {
    value
        .get("daily")
        .and_then(|d| d.get(key))
        .and_then(|a| a.get(idx))
        .and_then(Value::as_f64)
        .ok_or_else(|| ProviderError::Other(format!("missing daily '{key}' in weather response")))
}

/// 可缺省的日值字段（降水概率对部分地区为 null）
fn daily_opt_u64(value: &Value, key: &str, idx: usize) -> Option<u64> {
    value
        .get("daily")
        .and_then(|d| d.get(key))
        .and_then(|a| a.get(idx))
        .and_then(Value::as_u64)
}

#[async_trait]
impl WeatherProvider for OpenMeteoProvider {
    async fn current(&self, location: &str) -> Result<WeatherNow, ProviderError> {
        let (lat, lon) = self.resolve(location).await?;
        let data = self.fetch(lat, lon).await?;

        let current = data
            .get("current_weather")
            .ok_or_else(|| ProviderError::Other("no current weather in response".to_string()))?;
        let code = field_f64(current, &["weathercode"])? as u32;
        let observed_at = current
            .get("time")
            .and_then(Value::as_str)
            .and_then(|t| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M").ok())
            .ok_or_else(|| ProviderError::Other("unparsable observation time".to_string()))?;

        Ok(WeatherNow {
            location: location.to_string(),
            observed_at,
            temperature_c: field_f64(current, &["temperature"])?,
            wind_kmh: field_f64(current, &["windspeed"])?,
            weather_code: code,
            description: describe_weather_code(code).to_string(),
            rain_probability_pct: daily_opt_u64(&data, "precipitation_probability_max", 0),
        })
    }

    async fn forecast(&self, location: &str, day_offset: u64) -> Result<WeatherDay, ProviderError> {
        let (lat, lon) = self.resolve(location).await?;
        let data = self.fetch(lat, lon).await?;
        let idx = day_offset as usize;

        let date = data
            .get("daily")
            .and_then(|d| d.get("time"))
            .and_then(|a| a.get(idx))
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .ok_or_else(|| {
                ProviderError::NotFound(format!("no forecast available for day offset {day_offset}"))
            })?;
        let code = daily_f64(&data, "weathercode", idx)? as u32;

        Ok(WeatherDay {
            location: location.to_string(),
            date,
            temp_min_c: daily_f64(&data, "temperature_2m_min", idx)?,
            temp_max_c: daily_f64(&data, "temperature_2m_max", idx)?,
            precipitation_mm: daily_f64(&data, "precipitation_sum", idx)?,
            weather_code: code,
            description: describe_weather_code(code).to_string(),
            rain_probability_pct: daily_opt_u64(&data, "precipitation_probability_max", idx),
        })
    }
}
