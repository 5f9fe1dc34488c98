use clap::Parser;
use majority_capture_server::clock::{wall_clock_ms, ServerTimestamp};
use majority_capture_server::config::ServerSettings;
use majority_capture_server::constants::TICK_MS;
use majority_capture_server::replication::{ReplicaState, ReplicationMessage};
use majority_capture_server::scenario::{Scenario, ScenarioError, ScriptedOccupancy};
use majority_capture_server::types::TransitionKind;
use majority_capture_server::world::CaptureWorld;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

const REPLICA_CAPACITY: usize = 4_096;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Scenario JSON; the builtin scenario when omitted.
    #[arg(long)]
    scenario: Option<PathBuf>,
    /// Capture settings JSON; built-in defaults when omitted.
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = 1)]
    runs: u32,
    #[arg(long, default_value_t = TICK_MS)]
    tick_ms: u64,
    /// Runs with the majority rule switched off.
    #[arg(long)]
    disable_majority: bool,
    #[arg(long)]
    match_id: Option<String>,
    #[arg(long)]
    summary_out: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize)]
struct ScenarioResultLine {
    scenario: String,
    seed: u64,
    evaluator: String,
    #[serde(rename = "tickMs")]
    tick_ms: u64,
    ticks: u64,
    #[serde(rename = "durationMs")]
    duration_ms: u64,
    starts: u32,
    interrupts: u32,
    seizures: Vec<SeizureLine>,
    despawned: usize,
    #[serde(rename = "droppedMessages")]
    dropped_messages: u64,
    #[serde(rename = "finalControllers")]
    final_controllers: BTreeMap<String, String>,
    anomalies: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
struct SeizureLine {
    zone: String,
    faction: String,
    #[serde(rename = "atMs")]
    at_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
struct AnomalyRecord {
    tick: u64,
    message: String,
}

#[derive(Clone, Debug, Serialize)]
struct ScenarioRunResult {
    #[serde(flatten)]
    result: ScenarioResultLine,
    #[serde(rename = "anomalyRecords")]
    anomaly_records: Vec<AnomalyRecord>,
}

#[derive(Clone, Debug, Serialize)]
struct RunSummary {
    #[serde(rename = "matchId")]
    match_id: String,
    #[serde(rename = "startedAtMs")]
    started_at_ms: u64,
    #[serde(rename = "finishedAtMs")]
    finished_at_ms: u64,
    #[serde(rename = "scenarioCount")]
    scenario_count: usize,
    #[serde(rename = "anomalyCount")]
    anomaly_count: usize,
    #[serde(rename = "averageStarts")]
    average_starts: f64,
    #[serde(rename = "seizureCounts")]
    seizure_counts: BTreeMap<String, usize>,
    scenarios: Vec<ScenarioResultLine>,
}

#[derive(Clone, Debug, Serialize)]
struct StructuredLogLine {
    #[serde(rename = "timestampMs")]
    timestamp_ms: u64,
    level: String,
    event: String,
    #[serde(rename = "matchId")]
    match_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    scenario: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tick: Option<u64>,
    details: Value,
}

struct RemoteReplica {
    rx: mpsc::Receiver<ReplicationMessage>,
    state: ReplicaState,
}

fn main() {
    let cli = Cli::parse();
    let run_started_at_ms = wall_clock_ms();
    let seed = cli.seed.unwrap_or(run_started_at_ms);
    let match_id = cli
        .match_id
        .clone()
        .unwrap_or_else(|| default_match_id(seed, run_started_at_ms));

    let (settings, scenario) = match load_inputs(&cli) {
        Ok(inputs) => inputs,
        Err(message) => {
            emit_log(
                "error",
                "input_invalid",
                &match_id,
                None,
                None,
                None,
                json!({ "error": message }),
            );
            std::process::exit(2);
        }
    };

    let mut has_anomaly = false;
    let mut scenario_results = Vec::new();
    let mut seizure_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut total_anomalies = 0usize;

    for run in 0..cli.runs.max(1) {
        let run_seed = seed.wrapping_add(u64::from(run));
        emit_log(
            "info",
            "scenario_started",
            &match_id,
            Some(&scenario.name),
            Some(run_seed),
            None,
            json!({
                "durationSeconds": scenario.duration_seconds,
                "jitter": scenario.jitter,
                "tickMs": cli.tick_ms,
                "majorityEnabled": settings.majority_capture.enabled,
            }),
        );

        let scenario_run = match run_scenario(&settings, &scenario, run_seed, cli.tick_ms) {
            Ok(run) => run,
            Err(message) => {
                emit_log(
                    "error",
                    "scenario_failed",
                    &match_id,
                    Some(&scenario.name),
                    Some(run_seed),
                    None,
                    json!({ "error": message }),
                );
                std::process::exit(2);
            }
        };

        for anomaly in &scenario_run.anomaly_records {
            emit_log(
                "warn",
                "anomaly_detected",
                &match_id,
                Some(&scenario.name),
                Some(run_seed),
                Some(anomaly.tick),
                json!({ "message": anomaly.message }),
            );
        }

        if !scenario_run.result.anomalies.is_empty() {
            has_anomaly = true;
        }
        total_anomalies += scenario_run.anomaly_records.len();
        for seizure in &scenario_run.result.seizures {
            *seizure_counts
                .entry(format!("{}:{}", seizure.zone, seizure.faction))
                .or_insert(0) += 1;
        }

        emit_log(
            "info",
            "scenario_finished",
            &match_id,
            Some(&scenario.name),
            Some(run_seed),
            Some(scenario_run.result.ticks),
            json!({
                "starts": scenario_run.result.starts,
                "interrupts": scenario_run.result.interrupts,
                "seizures": scenario_run.result.seizures.len(),
                "anomalyCount": scenario_run.anomaly_records.len(),
            }),
        );

        match serde_json::to_string(&scenario_run.result) {
            Ok(line) => println!("{line}"),
            Err(error) => eprintln!("failed to serialize scenario result: {error}"),
        }
        scenario_results.push(scenario_run.result);
    }

    let summary = build_run_summary(
        match_id.clone(),
        run_started_at_ms,
        wall_clock_ms(),
        scenario_results,
        seizure_counts,
        total_anomalies,
    );

    let mut summary_out_written: Option<String> = None;
    if let Some(path) = cli.summary_out.as_ref() {
        if let Err(error) = write_summary(path, &summary) {
            emit_log(
                "error",
                "summary_write_failed",
                &match_id,
                None,
                None,
                None,
                json!({
                    "path": path.to_string_lossy(),
                    "error": error.to_string(),
                }),
            );
            std::process::exit(2);
        }
        summary_out_written = Some(path.to_string_lossy().to_string());
    }

    emit_log(
        "info",
        "run_finished",
        &match_id,
        None,
        None,
        None,
        json!({
            "scenarioCount": summary.scenario_count,
            "anomalyCount": summary.anomaly_count,
            "averageStarts": summary.average_starts,
            "seizureCounts": summary.seizure_counts,
            "summaryOut": summary_out_written,
        }),
    );

    if has_anomaly {
        std::process::exit(1);
    }
}

fn load_inputs(cli: &Cli) -> Result<(ServerSettings, Scenario), String> {
    let mut settings = match cli.settings.as_deref() {
        Some(path) => ServerSettings::from_file(path).map_err(|error| error.to_string())?,
        None => ServerSettings::default(),
    };
    if cli.disable_majority {
        settings.majority_capture.enabled = false;
    }
    let scenario = match cli.scenario.as_deref() {
        Some(path) => Scenario::from_file(path),
        None => Scenario::builtin(),
    }
    .and_then(|scenario| {
        scenario.validate(&settings)?;
        Ok::<_, ScenarioError>(scenario)
    })
    .map_err(|error| error.to_string())?;
    Ok((settings, scenario))
}

fn run_scenario(
    settings: &ServerSettings,
    scenario: &Scenario,
    seed: u64,
    tick_ms: u64,
) -> Result<ScenarioRunResult, String> {
    let mut world = CaptureWorld::from_settings(settings).map_err(|error| error.to_string())?;
    let origin = ServerTimestamp::from_millis(1);
    let mut occupancy =
        ScriptedOccupancy::new(scenario.clone(), world.factions().clone(), seed, origin);

    let (_, rx) = world.subscribe(REPLICA_CAPACITY);
    let mut remote = RemoteReplica {
        rx,
        state: ReplicaState::new(),
    };
    for view in world.zone_views() {
        remote.state.apply(&ReplicationMessage::ZoneSync { zone: view });
    }

    let evaluator = world
        .zones()
        .next()
        .map(|zone| zone.evaluator_name().to_string())
        .unwrap_or_default();
    let caps: BTreeMap<String, u32> = world
        .zones()
        .map(|zone| {
            (
                zone.name().to_string(),
                zone.state().limits.max_seizing_characters,
            )
        })
        .collect();

    let mut anomalies = Vec::new();
    let mut anomaly_records = Vec::new();
    let mut anomaly_seen = HashSet::new();
    let mut seizures = Vec::new();
    let mut despawned = 0usize;
    let tick_ms = tick_ms.max(1);
    let mut tick = 0u64;
    let mut now = origin;

    while !occupancy.is_finished(now) {
        for action in occupancy.take_due_actions(now) {
            if let Err(error) = action.apply(&mut world, now) {
                push_anomaly(
                    &mut anomalies,
                    &mut anomaly_records,
                    &mut anomaly_seen,
                    tick,
                    format!("scenario action failed: {error}"),
                );
            }
        }

        let report = world.tick(now, &mut occupancy);
        despawned += report.despawned.len();
        for seized in report.seized {
            seizures.push(SeizureLine {
                zone: seized.zone,
                faction: world.factions().display_key(Some(seized.faction)).to_string(),
                at_ms: seized.at_ms.diff_millis(origin),
            });
        }

        let mut messages = Vec::new();
        while let Ok(message) = remote.rx.try_recv() {
            messages.push(message);
        }
        for message in collect_replica_anomalies(&mut remote.state, &messages) {
            push_anomaly(
                &mut anomalies,
                &mut anomaly_records,
                &mut anomaly_seen,
                tick,
                message,
            );
        }
        for view in world.zone_views() {
            if caps.get(&view.zone).is_some_and(|cap| view.seizing > *cap) {
                push_anomaly(
                    &mut anomalies,
                    &mut anomaly_records,
                    &mut anomaly_seen,
                    tick,
                    format!("seizing count above cap in {}", view.zone),
                );
            }
            let replicated = remote.state.zone(&view.zone).and_then(|zone| zone.view.as_ref());
            if replicated != Some(&view) {
                push_anomaly(
                    &mut anomalies,
                    &mut anomaly_records,
                    &mut anomaly_seen,
                    tick,
                    format!("replica diverged from authority in {}", view.zone),
                );
            }
        }

        tick += 1;
        now = now.plus_millis(tick_ms);
    }

    let local = world.notifier().local();
    let mut starts = 0;
    let mut interrupts = 0;
    for view in world.zone_views() {
        let local_zone = local.zone(&view.zone);
        let remote_zone = remote.state.zone(&view.zone);
        let local_counts = local_zone.map(|zone| (zone.starts_observed, zone.interrupts_observed));
        let remote_counts =
            remote_zone.map(|zone| (zone.starts_observed, zone.interrupts_observed));
        if local_counts.unwrap_or_default() != remote_counts.unwrap_or_default() {
            push_anomaly(
                &mut anomalies,
                &mut anomaly_records,
                &mut anomaly_seen,
                tick,
                format!("replica missed transitions in {}", view.zone),
            );
        }
        let (zone_starts, zone_interrupts) = local_counts.unwrap_or_default();
        starts += zone_starts;
        interrupts += zone_interrupts;
    }

    let dropped_messages = world.notifier().dropped_messages();
    if dropped_messages > 0 {
        push_anomaly(
            &mut anomalies,
            &mut anomaly_records,
            &mut anomaly_seen,
            tick,
            format!("{dropped_messages} replication messages dropped"),
        );
    }

    let final_controllers = world
        .zone_views()
        .into_iter()
        .map(|view| {
            let key = world.factions().display_key(view.controller).to_string();
            (view.zone, key)
        })
        .collect();

    Ok(ScenarioRunResult {
        result: ScenarioResultLine {
            scenario: scenario.name.clone(),
            seed,
            evaluator,
            tick_ms,
            ticks: tick,
            duration_ms: now.diff_millis(origin),
            starts,
            interrupts,
            seizures,
            despawned,
            dropped_messages,
            final_controllers,
            anomalies,
        },
        anomaly_records,
    })
}

fn collect_replica_anomalies(
    replica: &mut ReplicaState,
    messages: &[ReplicationMessage],
) -> Vec<String> {
    let mut anomalies = Vec::new();
    for message in messages {
        if let ReplicationMessage::Transition { event } = message {
            let already_capturing = replica
                .zone(&event.zone)
                .is_some_and(|zone| zone.capturing.is_some() && !zone.interrupted);
            if event.kind == TransitionKind::Start && already_capturing {
                anomalies.push(format!("duplicate capture start in {}", event.zone));
            }
            let last_seq = replica.zone(&event.zone).map(|zone| zone.last_seq).unwrap_or(0);
            if event.seq != last_seq + 1 {
                anomalies.push(format!(
                    "transition sequence gap in {}: {} after {}",
                    event.zone, event.seq, last_seq
                ));
            }
        }
        replica.apply(message);
    }
    anomalies
}

fn push_anomaly(
    anomalies: &mut Vec<String>,
    anomaly_records: &mut Vec<AnomalyRecord>,
    anomaly_seen: &mut HashSet<String>,
    tick: u64,
    message: String,
) {
    anomaly_records.push(AnomalyRecord {
        tick,
        message: message.clone(),
    });
    if anomaly_seen.insert(message.clone()) {
        anomalies.push(message);
    }
}

fn default_match_id(seed: u64, timestamp_ms: u64) -> String {
    format!("sim-{seed}-{timestamp_ms}")
}

fn build_run_summary(
    match_id: String,
    started_at_ms: u64,
    finished_at_ms: u64,
    scenarios: Vec<ScenarioResultLine>,
    seizure_counts: BTreeMap<String, usize>,
    anomaly_count: usize,
) -> RunSummary {
    let scenario_count = scenarios.len();
    let total_starts: u32 = scenarios.iter().map(|scenario| scenario.starts).sum();
    let average_starts = if scenario_count == 0 {
        0.0
    } else {
        f64::from(total_starts) / scenario_count as f64
    };
    RunSummary {
        match_id,
        started_at_ms,
        finished_at_ms,
        scenario_count,
        anomaly_count,
        average_starts,
        seizure_counts,
        scenarios,
    }
}

fn emit_log(
    level: &str,
    event: &str,
    match_id: &str,
    scenario: Option<&str>,
    seed: Option<u64>,
    tick: Option<u64>,
    details: Value,
) {
    let log_line = StructuredLogLine {
        timestamp_ms: wall_clock_ms(),
        level: level.to_string(),
        event: event.to_string(),
        match_id: match_id.to_string(),
        scenario: scenario.map(|value| value.to_string()),
        seed,
        tick,
        details,
    };
    match serde_json::to_string(&log_line) {
        Ok(line) => eprintln!("{line}"),
        Err(error) => eprintln!("failed to serialize log line: {error}"),
    }
}

fn write_summary(path: &Path, summary: &RunSummary) -> io::Result<()> {
    let summary_text = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, summary_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use majority_capture_server::types::{FactionIndex, TransitionEvent};

    fn make_scenario_result(starts: u32) -> ScenarioResultLine {
        ScenarioResultLine {
            scenario: "test".to_string(),
            seed: 42,
            evaluator: "majority".to_string(),
            tick_ms: 50,
            ticks: 10,
            duration_ms: 500,
            starts,
            interrupts: 0,
            seizures: Vec::new(),
            despawned: 0,
            dropped_messages: 0,
            final_controllers: BTreeMap::new(),
            anomalies: Vec::new(),
        }
    }

    fn transition(seq: u64, kind: TransitionKind) -> ReplicationMessage {
        ReplicationMessage::Transition {
            event: TransitionEvent {
                zone: "levie".to_string(),
                seq,
                kind,
                faction: FactionIndex(1),
                at_ms: ServerTimestamp::from_millis(seq * 10),
            },
        }
    }

    #[test]
    fn default_match_id_contains_seed_and_timestamp() {
        assert_eq!(default_match_id(42, 123456789), "sim-42-123456789");
    }

    #[test]
    fn build_run_summary_calculates_average_starts() {
        let summary = build_run_summary(
            "sim-42-1".to_string(),
            1,
            2,
            vec![make_scenario_result(2), make_scenario_result(3)],
            BTreeMap::from([("levie:USSR".to_string(), 2usize)]),
            1,
        );
        assert!((summary.average_starts - 2.5).abs() < 1e-9);
        assert_eq!(summary.scenario_count, 2);
    }

    #[test]
    fn write_summary_returns_error_when_parent_does_not_exist() {
        let target = std::env::temp_dir()
            .join(format!("majority-capture-missing-{}", wall_clock_ms()))
            .join("summary.json");
        let summary = build_run_summary(
            "sim-1-1".to_string(),
            1,
            2,
            vec![make_scenario_result(1)],
            BTreeMap::new(),
            0,
        );
        assert!(write_summary(&target, &summary).is_err());
    }

    #[test]
    fn push_anomaly_keeps_records_and_deduplicates_summary_messages() {
        let mut anomalies = Vec::new();
        let mut records = Vec::new();
        let mut seen = HashSet::new();
        push_anomaly(&mut anomalies, &mut records, &mut seen, 10, "same".to_string());
        push_anomaly(&mut anomalies, &mut records, &mut seen, 11, "same".to_string());

        assert_eq!(anomalies.len(), 1);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].tick, 11);
    }

    #[test]
    fn replica_checks_flag_duplicate_starts_and_gaps() {
        let mut replica = ReplicaState::new();
        let clean = collect_replica_anomalies(
            &mut replica,
            &[
                transition(1, TransitionKind::Start),
                transition(2, TransitionKind::Interrupt),
                transition(3, TransitionKind::Start),
            ],
        );
        assert!(clean.is_empty());

        let flagged = collect_replica_anomalies(&mut replica, &[transition(5, TransitionKind::Start)]);
        assert_eq!(flagged.len(), 2);
    }

    #[test]
    fn builtin_scenario_runs_without_anomalies() {
        let settings = ServerSettings::default();
        let scenario = Scenario::builtin().expect("builtin scenario should parse");
        let run = run_scenario(&settings, &scenario, 7, TICK_MS).expect("scenario should run");
        assert!(run.result.anomalies.is_empty(), "{:?}", run.result.anomalies);
        assert!(run.result.starts >= 3);
        assert!(run.result.interrupts >= 1);
        assert_eq!(run.result.seizures.len(), 2);
        assert_eq!(
            run.result.final_controllers.get("levie").map(String::as_str),
            Some("USSR")
        );
        assert_eq!(
            run.result.final_controllers.get("morton").map(String::as_str),
            Some("US")
        );
        assert_eq!(run.result.despawned, 1);
        assert_eq!(run.result.dropped_messages, 0);
    }
}
