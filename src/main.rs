pub mod models {
    pub mod intuis;
    pub mod modes;
}

pub mod client;
pub mod config;
pub mod db {
    pub mod models;
}
pub mod host;
pub mod schema;
pub mod state;
pub mod utils;
pub mod services {
    pub mod backfill;
    pub mod energy;
    pub mod ingest;
    pub mod router;
    pub mod status;
    pub mod topology;
}

#[cfg(test)]
mod testing;

use crate::client::{HeatingApi, MullerClient};
use crate::config::Config;
use crate::host::Host;
use crate::models::modes::{HvacMode, WaterHeaterMode};
use crate::services::backfill::EnergyWorker;
use crate::services::energy::Reconciler;
use crate::services::ingest::{PgStatisticsSink, StatisticsSink};
use crate::services::status::{StatusBoard, StatusPoller};
use crate::services::topology::{self, BridgeLink, Topology};
use crate::state::{run_periodic, CycleOutcome, Shared, Shutdown};
use chrono::{TimeDelta, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{error, info, warn};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Run,
    Topology,
    Climate {
        room: String,
        mode: HvacMode,
        temperature_c: Option<f64>,
    },
    WaterHeater {
        room: String,
        mode: WaterHeaterMode,
    },
    ClearStatistics,
}

#[derive(Debug, Clone, PartialEq)]
struct Cli {
    env_file: Option<PathBuf>,
    command: Command,
}

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) if applied.is_empty() => {
            info!("Database schema is up to date; no migrations were applied");
            Ok(())
        }
        Ok(applied) => {
            let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
            info!("Applied {} database migration(s): {}", applied.len(), names);
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

/// Authenticates and resolves the topology; shared by every command.
fn connect_upstream(cfg: &Config) -> Result<(Arc<MullerClient>, Topology), String> {
    let client = Arc::new(MullerClient::new(
        &cfg.base_url,
        cfg.credentials.clone(),
        cfg.request_timeout,
    ));
    client
        .authenticate()
        .map_err(|e| format!("Authentication failed (check INTUIS_* credentials): {}", e))?;
    info!("Authenticated to {}", cfg.base_url);

    let homes = client.homes_data().map_err(|e| format!("homesdata failed: {}", e))?;
    let topo = topology::resolve(&homes).map_err(|e| format!("Topology: {}", e))?;
    info!(
        "Topology: {} home(s), {} room(s), {} module(s), {} issue(s)",
        topo.homes.len(),
        topo.room_count(),
        topo.module_count(),
        topo.issues.len()
    );
    Ok((client, topo))
}

fn join_worker(name: &str, handle: thread::JoinHandle<Result<(), String>>) -> Result<(), String> {
    match handle.join() {
        Ok(res) => res.map_err(|e| format!("{} worker: {}", name, e)),
        Err(_) => Err(format!("{} worker panicked", name)),
    }
}

fn run_daemon(cfg: Config) -> Result<(), String> {
    info!(
        "Config loaded (status_interval={}s, energy_interval={}s, stale_after_failures={}, backfill_enabled={}, max_lookback={}h, max_plausible_power={}W)",
        cfg.status_interval.as_secs(),
        cfg.energy_interval.as_secs(),
        cfg.poll.stale_after_failures,
        cfg.backfill.enabled,
        cfg.backfill.max_lookback.num_hours(),
        cfg.max_plausible_power_w
    );

    let mut conn = PgConnection::establish(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");
    apply_database_migrations(&mut conn)?;

    let (client, topo) = connect_upstream(&cfg)?;
    let api: Arc<dyn HeatingApi> = client;
    let topology = Arc::new(Shared::new(topo));
    let board = Arc::new(Shared::new(StatusBoard::default()));
    let shutdown = Arc::new(Shutdown::new());

    let status_handle = {
        let mut poller = StatusPoller::new(
            Arc::clone(&api),
            Arc::clone(&topology),
            Arc::clone(&board),
            cfg.poll.clone(),
        );
        let shutdown = Arc::clone(&shutdown);
        let interval = cfg.status_interval;
        thread::Builder::new()
            .name("status".into())
            .spawn(move || run_periodic("Status", interval, &shutdown, || poller.poll_once(Utc::now())))
            .map_err(|e| format!("spawning status worker failed: {}", e))?
    };

    let energy_handle = {
        let sink = PgStatisticsSink::new(conn);
        let reconciler = Reconciler::new(cfg.max_plausible_power_w, TimeDelta::hours(1));
        let mut worker = EnergyWorker::new(
            Arc::clone(&api),
            Arc::clone(&topology),
            sink,
            reconciler,
            cfg.backfill.clone(),
        );
        let shutdown = Arc::clone(&shutdown);
        let interval = cfg.energy_interval;
        // Spread hourly fetches of several instances.
        let max_jitter = (interval.as_secs() / 10).clamp(1, 300);
        let jitter = Duration::from_secs(rand::rng().random_range(0..max_jitter));
        thread::Builder::new()
            .name("energy".into())
            .spawn(move || {
                info!("Energy: first cycle in {}s", jitter.as_secs());
                if shutdown.wait_timeout(jitter) {
                    return Ok(());
                }
                run_periodic("Energy", interval, &shutdown, || worker.run_cycle(Utc::now()))
            })
            .map_err(|e| format!("spawning energy worker failed: {}", e))?
    };

    let status = join_worker("Status", status_handle);
    if status.is_err() {
        shutdown.trigger();
    }
    let energy = join_worker("Energy", energy_handle);
    status.and(energy)
}

fn print_topology(topo: &Topology) {
    for home in topo.homes.values() {
        println!("home {} ({})", home.id.0, home.name.as_deref().unwrap_or("-"));
        for room in home.rooms.values() {
            println!("  room {} \"{}\"", room.id.0, room.display_name());
            for module_id in &room.module_ids {
                let Some(module) = home.module(module_id) else {
                    continue;
                };
                let route = match &module.link {
                    BridgeLink::Direct => "direct".to_string(),
                    BridgeLink::Routed(bridge) => format!("via {}", bridge.0),
                    BridgeLink::Unresolved(e) => format!("uncontrollable: {}", e),
                };
                let role = if room.heating_module.as_ref() == Some(module_id) {
                    " [heating]"
                } else if room.water_heater_module.as_ref() == Some(module_id) {
                    " [water heater]"
                } else {
                    ""
                };
                println!("    module {} {} {}{}", module.id.0, module.tag, route, role);
            }
        }
    }
    for issue in &topo.issues {
        println!("issue: {}", issue);
    }
}

fn print_entities(host: &Host) {
    for c in host.climates() {
        let fmt_temp = |t: Option<f64>| t.map(|v| format!("{:.1}", v)).unwrap_or_else(|| "-".to_string());
        println!(
            "climate {}/{} \"{}\": mode={} action={} current={} target={} range={}..{}{}",
            c.home_id.0,
            c.room_id.0,
            c.name,
            c.mode.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string()),
            c.action.map(|a| format!("{:?}", a)).unwrap_or_else(|| "-".to_string()),
            fmt_temp(c.current_temperature_c),
            fmt_temp(c.target_temperature_c),
            c.min_temperature_c,
            c.max_temperature_c,
            if c.available { "" } else { " (unavailable)" }
        );
    }
    for w in host.water_heaters() {
        println!(
            "water heater {}/{} \"{}\": mode={}{}{}",
            w.home_id.0,
            w.room_id.0,
            w.name,
            w.mode.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string()),
            if w.controllable { "" } else { " (uncontrollable)" },
            if w.available { "" } else { " (unavailable)" }
        );
    }
    for id in host.energy_statistic_ids() {
        println!("energy feed {}", id);
    }
}

/// Builds a host over a freshly polled status board.
fn one_shot_host(cfg: &Config) -> Result<Host, String> {
    let (client, topo) = connect_upstream(cfg)?;
    let api: Arc<dyn HeatingApi> = client;
    let topology = Arc::new(Shared::new(topo));
    let board = Arc::new(Shared::new(StatusBoard::default()));
    let mut poller = StatusPoller::new(
        Arc::clone(&api),
        Arc::clone(&topology),
        Arc::clone(&board),
        cfg.poll.clone(),
    );
    match poller.poll_once(Utc::now())? {
        CycleOutcome::Continue => {}
        CycleOutcome::Fatal(reason) => return Err(reason),
    }
    Ok(Host::new(api, topology, board))
}

/// Deletes every persisted statistic; the next energy cycle rebuilds them from the lookback window.
fn clear_statistics(database_url: &str) -> Result<(), String> {
    let mut conn = PgConnection::establish(database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    apply_database_migrations(&mut conn)?;
    let removed = PgStatisticsSink::new(conn)
        .clear()
        .map_err(|e| format!("Clearing statistics failed: {}", e))?;
    info!("Cleared {} energy statistic row(s)", removed);
    warn!("A running daemon keeps its cursors in memory; restart it so totals restart from zero");
    Ok(())
}

fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        // Needs no upstream credentials.
        Command::ClearStatistics => clear_statistics(&config::database_url_from_env()),
        Command::Run => run_daemon(Config::from_env()?),
        Command::Topology => {
            let host = one_shot_host(&Config::from_env()?)?;
            print_topology(&host.topology());
            print_entities(&host);
            Ok(())
        }
        Command::Climate {
            room,
            mode,
            temperature_c,
        } => {
            let host = one_shot_host(&Config::from_env()?)?;
            let (home_id, room_id) = host.resolve_room(&room).ok_or_else(|| format!("unknown room: {}", room))?;
            if let Some(view) = host.climate(&home_id, &room_id) {
                info!(
                    "{}: currently {:?} at {:?}°C (target {:?}°C)",
                    view.name, view.mode, view.current_temperature_c, view.target_temperature_c
                );
            }
            let sent = match (mode, temperature_c) {
                (HvacMode::Heat, Some(t)) => host.set_target_temperature(&home_id, &room_id, t),
                (HvacMode::FrostProtection, _) => host.set_frost_protection(&home_id, &room_id),
                (mode, _) => host.set_hvac_mode(&home_id, &room_id, mode),
            }
            .map_err(|e| format!("climate command for {}: {}", room, e))?;
            info!("Sent {:?} to room {} in home {}", sent.state, room_id.0, home_id.0);
            Ok(())
        }
        Command::WaterHeater { room, mode } => {
            let host = one_shot_host(&Config::from_env()?)?;
            let (home_id, room_id) = host.resolve_room(&room).ok_or_else(|| format!("unknown room: {}", room))?;
            if let Some(view) = host.water_heaters().iter().find(|w| w.room_id == room_id) {
                if !view.controllable {
                    warn!("Water heater in {} is reported uncontrollable; sending anyway", view.name);
                }
            }
            let sent = host
                .set_water_heater_mode(&home_id, &room_id, mode)
                .map_err(|e| format!("water-heater command for {}: {}", room, e))?;
            info!("Sent {} to water heater in room {} ({:?})", mode, room_id.0, sent.addressing);
            Ok(())
        }
    }
}

const USAGE: &str = "usage: intuis-link [--env-file PATH] [run | topology | climate <room> <heat|auto|off|frost> [temp] | water-heater <room> <off|auto|force-on> | clear-statistics]";

fn parse_cli<I: IntoIterator<Item = String>>(args: I) -> Result<Cli, String> {
    let mut env_file: Option<PathBuf> = None;
    let mut positional = Vec::new();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let path = if arg == "--env-file" {
            Some(args.next().ok_or_else(|| "`--env-file` requires a path argument".to_string())?)
        } else {
            arg.strip_prefix("--env-file=").map(str::to_string)
        };
        match path {
            Some(p) if p.is_empty() => return Err("`--env-file` requires a path argument".to_string()),
            Some(_) if env_file.is_some() => return Err("`--env-file` provided more than once".to_string()),
            Some(p) => env_file = Some(PathBuf::from(p)),
            None if arg.starts_with("--") => return Err(format!("unrecognised argument: {}\n{}", arg, USAGE)),
            None => positional.push(arg),
        }
    }

    let mut words = positional.into_iter();
    let command = match words.next().as_deref() {
        None | Some("run") => Command::Run,
        Some("topology") => Command::Topology,
        Some("clear-statistics") => Command::ClearStatistics,
        Some("climate") => {
            let room = words.next().ok_or_else(|| USAGE.to_string())?;
            let raw_mode = words.next().ok_or_else(|| USAGE.to_string())?;
            let mode = HvacMode::parse(&raw_mode).ok_or_else(|| format!("unknown climate mode: {}", raw_mode))?;
            let temperature_c = match words.next() {
                Some(t) if mode == HvacMode::Heat => {
                    Some(t.parse::<f64>().map_err(|_| format!("invalid temperature: {}", t))?)
                }
                Some(_) => return Err(format!("a temperature only applies to heat mode\n{}", USAGE)),
                None => None,
            };
            Command::Climate {
                room,
                mode,
                temperature_c,
            }
        }
        Some("water-heater") => {
            let room = words.next().ok_or_else(|| USAGE.to_string())?;
            let raw_mode = words.next().ok_or_else(|| USAGE.to_string())?;
            let mode =
                WaterHeaterMode::parse(&raw_mode).ok_or_else(|| format!("unknown water-heater mode: {}", raw_mode))?;
            Command::WaterHeater { room, mode }
        }
        Some(other) => return Err(format!("unknown command: {}\n{}", other, USAGE)),
    };
    if let Some(extra) = words.next() {
        return Err(format!("unexpected argument: {}\n{}", extra, USAGE));
    }
    Ok(Cli { env_file, command })
}

fn load_env(explicit: Option<&Path>) -> Result<Option<LoadedEnvFile>, String> {
    let (path, explicit) = match explicit {
        Some(p) if !p.is_file() => return Err(format!("env file not found: {}", p.display())),
        Some(p) => (p.to_path_buf(), true),
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let default_path = cwd.join(".env");
            if !default_path.is_file() {
                return Ok(None);
            }
            (default_path, false)
        }
    };

    let content =
        std::fs::read_to_string(&path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (index, line) in content.lines().enumerate() {
        let Some((key, value)) = parse_env_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?
        else {
            continue;
        };
        // Process environment wins over the file.
        if std::env::var_os(&key).is_none() {
            // Called before any thread is spawned.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(Some(LoadedEnvFile { path, explicit }))
}

/// Parses `[export] KEY=VALUE`. Values may be bare (trailing `# comment` dropped),
/// single-quoted (literal) or double-quoted (`\n`, `\t`, `\"`, `\\` escapes).
fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    let (key, raw) = line.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(format!("invalid variable name: {:?}", key));
    }

    let raw = raw.trim();
    let quote = match raw.chars().next() {
        Some(q @ ('"' | '\'')) => q,
        _ => {
            let bare = raw.split('#').next().unwrap_or_default().trim_end();
            return Ok(Some((key.to_string(), bare.to_string())));
        }
    };

    let mut value = String::new();
    let mut chars = raw[1..].chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if quote == '"' => match chars.next() {
                Some('n') => value.push('\n'),
                Some('r') => value.push('\r'),
                Some('t') => value.push('\t'),
                Some(other) => value.push(other),
                None => return Err("unterminated escape sequence".to_string()),
            },
            c if c == quote => {
                let rest = chars.as_str().trim();
                if !rest.is_empty() && !rest.starts_with('#') {
                    return Err("unexpected characters after closing quote".to_string());
                }
                return Ok(Some((key.to_string(), value)));
            }
            c => value.push(c),
        }
    }
    Err(format!("unterminated {} quoted value", if quote == '"' { "double" } else { "single" }))
}

fn main() {
    let cli = match parse_cli(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(2);
        }
    };
    let loaded_env = match load_env(cli.env_file.as_deref()) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // After the env file so RUST_LOG from it is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "intuis-link {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(cli) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
