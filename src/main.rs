//! Demo: one trim/undo cycle against the simulated beamline.
//!
//! Usage: `lemtrim [config.yaml]`. Set `RUST_LOG=debug` for fetch details.

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use lemtrim::data::deviation::{classify_energy_errors, energy_error_pct, DeviationClass, DeviationSummary};
use lemtrim::persistence::save_state_to_path;
use lemtrim::sim::SimulatedBeamline;
use lemtrim::sink::latest_profile;
use lemtrim::{
    channel_profile, Fetcher, LegacyBackend, LiveDataSource, ModernBackend, TrimConfig,
    TrimController, TrimOutcome, UndoOutcome,
};

fn main() -> lemtrim::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => TrimConfig::load(&PathBuf::from(path))?,
        None => TrimConfig::default(),
    };
    info!(audit_dir = %config.audit_dir.display(), "configuration loaded");

    let sim = SimulatedBeamline::demo(&config.set_point_suffix);
    let fetcher = Fetcher::new(sim.clone(), sim.clone(), config.set_point_suffix.clone());
    let modern = ModernBackend::new(sim.clone(), config.set_point_suffix.clone());
    let legacy = LegacyBackend::new(sim.clone());
    let (sink, profiles) = channel_profile(config.profile_channel.clone());

    let mut ctrl = TrimController::from_config(&config, fetcher, modern, legacy, sink);
    let status = ctrl.status().subscribe_all();

    let snapshot = ctrl.refresh()?.clone();
    let summary = DeviationSummary::compute(&snapshot, ctrl.trim_source(), &config);
    println!(
        "set points: {} within {}%, {} out of tolerance, {} excluded, {} undefined",
        summary.count(DeviationClass::WithinTolerance),
        config.tolerance_pct,
        summary.count(DeviationClass::OutOfTolerance),
        summary.count(DeviationClass::Excluded),
        summary.count(DeviationClass::Undefined),
    );
    for point in summary.out_of_tolerance() {
        if let Some(pct) = point.error_pct {
            println!("  {:<16} s={:>8.1}  {:+.2}%", point.device_name, point.s_position, pct);
        }
    }

    let mut live_source = sim.clone();
    let design = live_source.fetch_table()?.eref;
    let live = live_source.fetch_live_momentum()?;
    let energy = classify_energy_errors(&energy_error_pct(&live, &design)?, config.tolerance_pct);
    println!(
        "energy: {} of {} elements out of tolerance",
        energy.iter().filter(|c| **c == DeviationClass::OutOfTolerance).count(),
        energy.len()
    );

    match ctrl.trim() {
        Ok(TrimOutcome::Applied { report, audit }) => {
            println!("trim: {} failures, audit in {audit}", report.failures().count())
        }
        Ok(TrimOutcome::AlreadySet) => println!("trim: already set"),
        Err(e) => println!("trim rejected: {e}"),
    }
    if let Some(p) = latest_profile(&profiles) {
        println!("published #{} on {} ({} values)", p.seq, p.channel, p.values.len());
    }

    match ctrl.undo() {
        Ok(UndoOutcome::Restored(_)) => println!("undo: restored"),
        Ok(UndoOutcome::Incomplete(report)) => {
            println!("undo: {} devices failed", report.failures().count())
        }
        Err(e) => println!("undo rejected: {e}"),
    }

    std::fs::create_dir_all(&config.audit_dir)?;
    let session_path = config.audit_dir.join("session.json");
    save_state_to_path(&ctrl.session_state(), &session_path)?;
    info!(path = %session_path.display(), "session saved");

    println!("--- status ---");
    for message in status.try_iter() {
        println!("{}", message.line());
    }
    Ok(())
}
