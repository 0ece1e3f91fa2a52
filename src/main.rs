use std::{
    error::Error,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use clap::Parser;
use sweep_stitcher::{
    args::{convert_filter, Args},
    exfil::timestamped_name,
    rtl_power::{RtlPowerFactory, RtlPowerFile},
    BaselineMode, Measurement, SourceFactory, SweepController,
};
use tracing::{info, warn};

fn run<F: SourceFactory>(
    factory: F,
    args: &Args,
    running: Arc<AtomicBool>,
) -> Result<Measurement, Box<dyn Error>> {
    let settings = args.sweep_settings()?;
    let mut controller = SweepController::new(factory, settings, args.controller_config())?;
    if let Some(path) = &args.baseline {
        controller.set_baseline(Measurement::load_csv(path)?);
    }
    controller.launch()?;

    let frame = Duration::from_millis(args.frame_ms);
    let mut reported = 0;
    while running.load(Ordering::Acquire) {
        controller.update();
        let sweeps = controller.status().sweeps as usize;
        if sweeps != reported {
            reported = sweeps;
            info!(sweeps, "Sweep finished");
        }
        if args.sweeps.map_or(false, |limit| controller.measures().len() >= limit) {
            break;
        }
        if !controller.is_running() && !controller.launch_flag().load(Ordering::Acquire) {
            if !controller.get_power_status() {
                warn!("Capture source exited");
            }
            break;
        }
        thread::sleep(frame);
    }
    controller.stop();

    if let Some(offset) = controller.baseline_offset() {
        let relative = controller.relative_power(BaselineMode::Average);
        let peak = relative
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, (i, v)| if *v > acc.1 { (i, *v) } else { acc });
        info!(
            bins = offset.len(),
            freq = controller.current().get_bin_center_freq(peak.0),
            db = peak.1,
            "Largest rise over baseline"
        );
    }
    Ok(controller.current().clone())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    // Stop cleanly on ctrl-c so the results still get written
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::Release))?;

    let meas = match &args.replay {
        Some(path) => run(RtlPowerFile { path: path.clone() }, &args, running)?,
        None => {
            let factory = RtlPowerFactory {
                program: args.rtl_power.clone(),
                device: args.device,
                ..Default::default()
            };
            run(factory, &args, running)?
        }
    };

    let csv = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(timestamped_name("csv")));
    meas.save_csv(&csv)?;
    info!(path = %csv.display(), "Wrote measurement");
    if args.binary {
        let meta = csv.with_extension("meta");
        let raw = csv.with_extension("raw");
        meas.save_bin(&meta, &raw)?;
        info!(meta = %meta.display(), raw = %raw.display(), "Wrote binary measurement");
    }
    Ok(())
}
