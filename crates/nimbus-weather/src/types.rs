use serde::{Deserialize, Serialize};

/// Weather condition categories mapped from provider condition codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeatherCondition {
    #[default]
    Clear,
    PartlyCloudy,
    Cloudy,
    Fog,
    Drizzle,
    Rain,
    HeavyRain,
    Snow,
    Sleet,
    Thunderstorm,
}

impl WeatherCondition {
    /// Convert a One Call condition id to a WeatherCondition
    /// See: https://openweathermap.org/weather-conditions
    pub fn from_condition_id(id: i32) -> Self {
        match id {
            200..=232 => Self::Thunderstorm,
            300..=321 => Self::Drizzle,
            500 | 501 | 520 | 521 => Self::Rain,
            502..=504 | 522 | 531 => Self::HeavyRain,
            511 => Self::Sleet, // Freezing rain
            600..=602 | 620..=622 => Self::Snow,
            611..=616 => Self::Sleet,
            701..=781 => Self::Fog, // Mist, haze, dust, ...
            801 | 802 => Self::PartlyCloudy,
            803 | 804 => Self::Cloudy,
            _ => Self::Clear, // 800 and unknown ids
        }
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Self::Clear => "Clear",
            Self::PartlyCloudy => "Partly Cloudy",
            Self::Cloudy => "Cloudy",
            Self::Fog => "Fog",
            Self::Drizzle => "Drizzle",
            Self::Rain => "Rain",
            Self::HeavyRain => "Heavy Rain",
            Self::Snow => "Snow",
            Self::Sleet => "Sleet",
            Self::Thunderstorm => "Thunderstorm",
        }
    }
}

/// One entry of a `weather` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionCode {
    pub id: i32,
    #[serde(default)]
    pub main: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: String,
}

/// Current conditions block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentConditions {
    /// Provider timestamp, seconds since epoch
    pub dt: i64,
    #[serde(default)]
    pub temp: f64,
    #[serde(default)]
    pub feels_like: f64,
    #[serde(default)]
    pub humidity: u8,
    #[serde(default)]
    pub wind_speed: f64,
    #[serde(default)]
    pub weather: Vec<ConditionCode>,
}

/// Hourly forecast entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyForecast {
    pub dt: i64,
    #[serde(default)]
    pub temp: f64,
    /// Probability of precipitation, 0.0 - 1.0
    #[serde(default)]
    pub pop: f64,
    #[serde(default)]
    pub weather: Vec<ConditionCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DailyTemperature {
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
}

/// Daily forecast entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyForecast {
    pub dt: i64,
    #[serde(default)]
    pub temp: DailyTemperature,
    pub sunrise: Option<i64>,
    pub sunset: Option<i64>,
    #[serde(default)]
    pub pop: f64,
    #[serde(default)]
    pub weather: Vec<ConditionCode>,
}

/// Decoded One Call payload. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Forecast {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub timezone: Option<String>,
    pub timezone_offset: Option<i32>,
    pub current: Option<CurrentConditions>,
    #[serde(default)]
    pub hourly: Vec<HourlyForecast>,
    #[serde(default)]
    pub daily: Vec<DailyForecast>,
}

impl Forecast {
    /// Provider-reported recency (`current.dt`), or 0 when absent.
    pub fn as_of_epoch(&self) -> i64 {
        self.current.as_ref().map_or(0, |c| c.dt)
    }

    /// Condition of the current block, if the provider sent one.
    pub fn condition(&self) -> Option<WeatherCondition> {
        self.current
            .as_ref()
            .and_then(|c| c.weather.first())
            .map(|w| WeatherCondition::from_condition_id(w.id))
    }
}
