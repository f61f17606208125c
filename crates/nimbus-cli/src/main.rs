//! nimbus: command-line front end for the offline-first weather cache.
//!
//! Cached data is printed first; the network is only used to revalidate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use nimbus_core::{AppError, Config};
use nimbus_weather::{
    FavoriteStore, FixedLocation, ForecastWithMeta, LastLocationStore, LocationId, OneCallClient,
    PowerPolicy, SessionSettings, SysfsConditions, SystemClock, UnitSystem, ViewState,
    WeatherCache, WeatherSession,
};

type Session = WeatherSession<OneCallClient, FixedLocation>;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(3);

/// Offline-first weather snapshot cache
#[derive(Parser)]
#[command(name = "nimbus", about = "Offline-first weather snapshot cache")]
struct Cli {
    /// Path to config.toml (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show weather for a place: cached data first, then revalidate.
    Show {
        #[arg(long, allow_hyphen_values = true, requires = "lon")]
        lat: Option<f64>,
        #[arg(long, allow_hyphen_values = true, requires = "lat")]
        lon: Option<f64>,
        /// Display label for the place
        #[arg(long)]
        label: Option<String>,
        /// metric, imperial or standard
        #[arg(long)]
        unit: Option<UnitSystem>,
        /// Revalidate even if the cached snapshot is still fresh.
        #[arg(long)]
        force: bool,
    },
    /// Revalidate saved places (skipped when offline or on low battery).
    RefreshFavorites {
        #[arg(long)]
        unit: Option<UnitSystem>,
        #[arg(long)]
        force: bool,
    },
    /// Manage saved places.
    Favorite {
        #[command(subcommand)]
        action: FavoriteCommand,
    },
    /// Show or change the remembered unit system.
    Unit {
        #[command(subcommand)]
        action: UnitCommand,
    },
    /// Delete all cached snapshots, favorites and the last location.
    Clear,
}

#[derive(Subcommand)]
enum UnitCommand {
    Show,
    /// Save the unit system used when --unit is not given.
    Set { unit: UnitSystem },
}

#[derive(Subcommand)]
enum FavoriteCommand {
    Add {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        #[arg(long)]
        label: String,
        #[arg(long)]
        unit: Option<UnitSystem>,
    },
    Remove {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
    /// Keep a favorite at the top of the list.
    Pin {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
    Unpin {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    nimbus_core::init()?;
    let cli = Cli::parse();

    let result = run(cli).await;
    if let Err(e) = &result {
        if let Some(app) = e.downcast_ref::<AppError>() {
            eprintln!("{}", app.user_message());
        }
    }
    result
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let (mut config, _) = Config::load_validated(Some(&config_path))?;
    let default_unit = UnitSystem::from(config.weather.default_unit);

    match cli.command {
        Command::Show { lat, lon, label, unit, force } => {
            let session = build_session(&config)?;
            let unit = unit.unwrap_or(default_unit);
            show(&session, lat.zip(lon), label, unit, force).await
        }
        Command::RefreshFavorites { unit, force } => {
            let session = build_session(&config)?;
            let unit = unit.unwrap_or(default_unit);
            let favorites = session.cache().favorites().list().await.map_err(AppError::from)?;
            let report = session
                .cache()
                .fanout()
                .refresh_favorites_if_allowed(&favorites, unit, config.refresh.max_parallel, force)
                .await;
            if report.gated {
                println!("Skipped: device is offline or saving power.");
            } else {
                println!(
                    "{} updated, {} unchanged, {} still fresh, {} failed",
                    report.updated, report.not_modified, report.fresh, report.failed
                );
            }
            Ok(())
        }
        Command::Favorite { action } => {
            let session = build_session(&config)?;
            favorite(&session, action, default_unit).await
        }
        Command::Unit { action: UnitCommand::Show } => {
            println!("{}", default_unit);
            Ok(())
        }
        Command::Unit { action: UnitCommand::Set { unit } } => {
            config.weather.default_unit = unit.into();
            config.save_to(&config_path)?;
            println!("Default unit set to {}", unit);
            Ok(())
        }
        Command::Clear => {
            let session = build_session(&config)?;
            session.clear_all_data().await.map_err(AppError::from)?;
            println!("All weather data cleared.");
            Ok(())
        }
    }
}

fn build_session(config: &Config) -> Result<Session> {
    let source = Arc::new(
        OneCallClient::from_config(&config.weather)
            .map_err(AppError::from)
            .context("Failed to create weather client")?,
    );
    let policy = PowerPolicy {
        min_battery_percent: config.refresh.min_battery_percent,
    };
    let cache = WeatherCache::open(
        &config.database_path(),
        source,
        Arc::new(SystemClock),
        Arc::new(SysfsConditions::new()),
        policy,
        config.weather.ttl_ms(),
    )
    .map_err(AppError::from)
    .context("Failed to open weather cache")?;
    let last = LastLocationStore::open(config.last_location_path());

    Ok(WeatherSession::new(
        cache,
        last,
        Arc::new(FixedLocation::none()),
        SessionSettings::from_config(config),
    ))
}

async fn show(
    session: &Session,
    coords: Option<(f64, f64)>,
    label: Option<String>,
    unit: UnitSystem,
    force: bool,
) -> Result<()> {
    let mut view = session.subscribe();

    let handle = match coords {
        Some((lat, lon)) => session.bind_location(lat, lon, unit, label),
        None => session.bind_from_last_or_current(unit).await,
    };
    match handle.await.context("Revalidation task failed")? {
        Ok(outcome) => info!("Revalidation: {:?}", outcome),
        Err(e) => report_refresh_failure("Revalidation", e.into()),
    }
    if force {
        if let Err(e) = session.refresh(true).await {
            report_refresh_failure("Forced refresh", e.into());
        }
    }

    let settled = tokio::time::timeout(
        SETTLE_TIMEOUT,
        view.wait_for(|v| matches!(v, ViewState::HasData(_) | ViewState::Error(_))),
    )
    .await;
    let state = match settled {
        Ok(Ok(state)) => state.clone(),
        _ => session.view(),
    };

    match state {
        ViewState::HasData(value) => {
            print_forecast(&value, unit);
            wait_for_last_location(session).await;
        }
        ViewState::Error(message) => println!("{}", message),
        ViewState::Idle | ViewState::Loading => println!("No weather data available yet."),
    }
    Ok(())
}

/// Cached data, if any, is still shown; the failure only goes to the log.
fn report_refresh_failure(what: &str, err: AppError) {
    warn!("{} failed: {} ({})", what, err.user_message(), err);
}

async fn wait_for_last_location(session: &Session) {
    let Some(binding) = session.binding() else {
        return;
    };
    let mut rx = session.last_location().observe();
    let saved = tokio::time::timeout(
        SETTLE_TIMEOUT,
        rx.wait_for(|last| {
            last.as_ref().is_some_and(|l| l.location_id == binding.key.location_id)
        }),
    )
    .await;
    if !matches!(saved, Ok(Ok(_))) {
        warn!("Last location was not saved before exit");
    }
}

async fn favorite(session: &Session, action: FavoriteCommand, default_unit: UnitSystem) -> Result<()> {
    let favorites = session.cache().favorites();
    match action {
        FavoriteCommand::Add { lat, lon, label, unit } => {
            let unit = unit.unwrap_or(default_unit);
            let handle = session
                .add_favorite(lat, lon, &label, unit)
                .await
                .map_err(AppError::from)?;
            println!("Saved {} ({})", label, LocationId::from_coords(lat, lon));
            match handle.await.context("Refresh task failed")? {
                Ok(outcome) => info!("Favorite refresh: {:?}", outcome),
                Err(e) => {
                    let err = AppError::from(e);
                    println!("Could not fetch weather yet: {}", err.user_message());
                }
            }
        }
        FavoriteCommand::Remove { lat, lon } => {
            let id = LocationId::from_coords(lat, lon);
            if favorites.remove(&id).await.map_err(AppError::from)? {
                println!("Removed {}", id);
            } else {
                println!("No favorite at {}", id);
            }
        }
        FavoriteCommand::Pin { lat, lon } => set_pinned(favorites, lat, lon, true).await?,
        FavoriteCommand::Unpin { lat, lon } => set_pinned(favorites, lat, lon, false).await?,
        FavoriteCommand::List => {
            let list = favorites.list().await.map_err(AppError::from)?;
            if list.is_empty() {
                println!("No favorites saved.");
            }
            for fav in list {
                let pin = if fav.pinned { "*" } else { " " };
                println!("{} {:<24} {}", pin, fav.city_label, fav.location_id);
            }
        }
    }
    Ok(())
}

async fn set_pinned(favorites: &FavoriteStore, lat: f64, lon: f64, pinned: bool) -> Result<()> {
    let id = LocationId::from_coords(lat, lon);
    if favorites.set_pinned(&id, pinned).await.map_err(AppError::from)? {
        println!("{} {}", if pinned { "Pinned" } else { "Unpinned" }, id);
    } else {
        println!("No favorite at {}", id);
    }
    Ok(())
}

fn print_forecast(value: &ForecastWithMeta, unit: UnitSystem) {
    let (temp_unit, speed_unit) = match unit {
        UnitSystem::Metric => ("°C", "m/s"),
        UnitSystem::Imperial => ("°F", "mph"),
        UnitSystem::Standard => ("K", "m/s"),
    };
    let meta = &value.meta;

    println!("{} ({:.4}, {:.4})", meta.city_label, meta.lat, meta.lon);
    if let Some(as_of) = DateTime::<Utc>::from_timestamp(meta.as_of_epoch, 0).filter(|_| meta.as_of_epoch > 0) {
        println!("  as of   {}", as_of.with_timezone(&Local).format("%Y-%m-%d %H:%M"));
    }
    if let Some(fetched) = DateTime::<Utc>::from_timestamp_millis(meta.fetched_at_ms) {
        println!("  fetched {}", fetched.with_timezone(&Local).format("%Y-%m-%d %H:%M"));
    }

    if let Some(current) = &value.forecast.current {
        let condition = value
            .forecast
            .condition()
            .map(|c| c.description())
            .unwrap_or("Unknown");
        println!(
            "  {:.1}{} (feels like {:.1}{}), {}",
            current.temp, temp_unit, current.feels_like, temp_unit, condition
        );
        println!("  humidity {}%, wind {:.1} {}", current.humidity, current.wind_speed, speed_unit);
    }

    for day in value.forecast.daily.iter().take(5) {
        let Some(date) = DateTime::<Utc>::from_timestamp(day.dt, 0) else {
            continue;
        };
        println!(
            "  {}  {:>5.1} / {:<5.1}{}",
            date.with_timezone(&Local).format("%a %d"),
            day.temp.min,
            day.temp.max,
            temp_unit
        );
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn test_parse_unit_set() {
        let cli = Cli::try_parse_from(["nimbus", "unit", "set", "imperial"]).unwrap();
        match cli.command {
            Command::Unit { action: UnitCommand::Set { unit } } => {
                assert_eq!(unit, UnitSystem::Imperial)
            }
            _ => panic!("expected unit set"),
        }
    }

    #[test]
    fn test_parse_unit_set_rejects_unknown_system() {
        assert!(Cli::try_parse_from(["nimbus", "unit", "set", "kelvin"]).is_err());
    }

    #[test]
    fn test_parse_favorite_pin_with_negative_coords() {
        let cli =
            Cli::try_parse_from(["nimbus", "favorite", "pin", "--lat", "-33.87", "--lon", "151.21"])
                .unwrap();
        match cli.command {
            Command::Favorite { action: FavoriteCommand::Pin { lat, lon } } => {
                assert_eq!((lat, lon), (-33.87, 151.21));
            }
            _ => panic!("expected favorite pin"),
        }
    }

    #[test]
    fn test_app_error_is_found_under_context() {
        let err: anyhow::Error = Err::<(), _>(AppError::Weather(nimbus_core::WeatherError::InvalidApiKey))
            .context("Failed to create weather client")
            .unwrap_err();
        let app = err.downcast_ref::<AppError>().expect("AppError under context");
        assert!(app.user_message().contains("API key"));
    }
}
