//! Run orchestration: inputs, outputs, the engine call, and post-processing

use crate::error::{CliError, CliResult};
use crate::sockets::{CommandLink, ViewerLink};
use crate::Cli;
use indicatif::{ProgressBar, ProgressStyle};
use respire_engine::engine::{SpikeArchive, WaveArchive};
use respire_engine::{condi, quiet, ControlLink, ControlPoll, Engine, NetworkBuilder, Outputs};
use respire_model::{NetworkDescription, RunScript};
use respire_storage::{markers, EventFormat, EventTableWriter, WaveFileWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Set by the termination signal handler; the engine polls it between ticks
static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_term(_sig: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler: extern "C" fn(libc::c_int) = handle_term;
    // Safety: the handler only stores to an atomic flag
    unsafe {
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

/// Progress display standing in for the launcher when running standalone
struct ProgressLink {
    bar: ProgressBar,
}

impl ProgressLink {
    fn new(total_seconds: u64) -> Self {
        let bar = ProgressBar::new(total_seconds.max(1));
        bar.set_style(
            ProgressStyle::with_template("{elapsed_precise} [{bar:40}] {pos}/{len} s")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self { bar }
    }

    fn finish(self) {
        self.bar.finish_and_clear();
    }
}

impl ControlLink for ProgressLink {
    fn poll(&mut self) -> ControlPoll {
        ControlPoll::default()
    }

    fn send_progress(&mut self, seconds: f64) {
        self.bar.set_position(seconds as u64);
    }

    fn recv_description(&mut self) -> respire_engine::Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

fn resolve_input(input_dir: Option<&Path>, name: &str) -> PathBuf {
    // a script names its description relative to itself
    let file_name = Path::new(name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(name));
    match input_dir {
        Some(dir) => dir.join(file_name),
        None => PathBuf::from(name),
    }
}

/// Execute one simulation run from the parsed command line
pub fn run(cli: Cli) -> CliResult<()> {
    install_signal_handlers();

    if cli.file && cli.socket {
        warn!("only one of --file or --socket can be used; writing files");
    }
    let use_socket = cli.socket && !cli.file;

    // inputs: socket-delivered from the launcher, or a script file
    let mut command_link = None;
    let mut viewer_port = None;
    let (script_text, desc_override, input_dir) = if let Some(port) = cli.port {
        let mut link = CommandLink::connect(&cli.host, port)?;
        let (vport, script, desc) = link.get_essentials(use_socket)?;
        viewer_port = vport;
        command_link = Some(link);
        (
            String::from_utf8_lossy(&script).into_owned(),
            Some(String::from_utf8_lossy(&desc).into_owned()),
            None,
        )
    } else if let Some(path) = &cli.script {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CliError::config(format!("cannot open script file {}: {}", path.display(), e))
        })?;
        (text, None, path.parent().map(Path::to_path_buf))
    } else {
        return Err(CliError::config(
            "no input given: use --script PATH or --port N",
        ));
    };

    let script = RunScript::parse(&script_text)?;
    let desc_text = match desc_override {
        Some(text) => text,
        None => {
            let path = resolve_input(input_dir.as_deref(), &script.description_file);
            std::fs::read_to_string(&path).map_err(|e| {
                CliError::config(format!(
                    "cannot open description file {}: {}",
                    path.display(),
                    e
                ))
            })?
        }
    };
    let mut desc = NetworkDescription::parse(&desc_text)?;
    if cli.nonoise {
        info!("quiet model requested, folding out the stochastic texture");
        quiet::quiet_model(&mut desc);
    }

    let out_dir = cli
        .output
        .clone()
        .or_else(|| input_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&out_dir)?;

    info!("building network");
    let mut builder = NetworkBuilder::new(&desc);
    if let Some(dir) = &input_dir {
        builder = builder.with_input_dir(dir);
    }
    let net = builder.build()?;

    let spawn = script.plot.as_ref().map(|p| p.spawn_number).unwrap_or(0);
    if cli.condi {
        let paths = condi::write_condi(&net, &out_dir, spawn)?;
        for path in paths {
            info!("wrote {}", path.display());
        }
    }

    let mut engine = Engine::new(net, &script, input_dir.as_deref())?;

    // outputs
    let save_bdt = script.save_spike_times || cli.bdt;
    let save_smr = script.save_spike_archive || cli.smr;
    let save_wave = script.save_wave_archive || cli.wave;

    let mut outputs = Outputs::default();
    outputs.set_spike_channels(&script.spike_channels);
    let mut table_path = None;

    if save_bdt || save_smr || save_wave {
        let name = script.output_name.clone().ok_or_else(|| {
            CliError::config("output requested but the script names no output file")
        })?;
        outputs.event_format = EventFormat::from_name(&name);
        let base = out_dir.join(&name);
        if save_bdt {
            outputs.event_table = Some(EventTableWriter::create(&base, outputs.event_format)?);
            table_path = Some(base.clone());
        }
        if save_smr {
            let path = base.with_extension("rarc");
            outputs.spike_archive = Some(SpikeArchive::create(
                &path,
                desc.global.step,
                &outputs.cwrit,
                &outputs.fwrit,
                script.analog.as_ref().map(|a| a.interval_ms),
            )?);
            info!("spike archive at {}", path.display());
        }
        if save_wave {
            let stem = base
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "run".into());
            let path = out_dir.join(format!("{}_wave.rarc", stem));
            let plots = script
                .plot
                .as_ref()
                .map(|p| p.channels.clone())
                .unwrap_or_default();
            outputs.wave_archive = Some(WaveArchive::create(&path, desc.global.step, &plots)?);
            info!("waveform archive at {}", path.display());
        }
    }

    if script.plot.is_some() {
        if use_socket {
            let port = viewer_port.ok_or_else(|| {
                CliError::connection("socket output requested but no viewer port received")
            })?;
            outputs.plot_sink = Some(Box::new(ViewerLink::connect(&cli.host, port, spawn)?));
        } else if cli.file {
            outputs.plot_sink = Some(Box::new(WaveFileWriter::new(&out_dir, spawn)));
        }
    }

    // the run itself, reporting either to the launcher or a local bar
    let summary = match command_link.as_mut() {
        Some(link) => engine.run(&mut outputs, Some(link), Some(&STOP))?,
        None => {
            let seconds =
                (desc.global.step_count as f64 * desc.global.step / 1000.0).ceil() as u64;
            let mut progress = ProgressLink::new(seconds);
            let summary = engine.run(&mut outputs, Some(&mut progress), Some(&STOP))?;
            progress.finish();
            summary
        }
    };
    info!(
        "simulation finished after {} steps{}",
        summary.steps_executed,
        if summary.terminated {
            " (terminated early)"
        } else {
            ""
        }
    );

    // post-run marker insertion over the produced event table
    if let Some(path) = table_path {
        match &script.analog {
            Some(analog) if desc.global.markers.enabled() => {
                match markers::insert_markers(
                    &path,
                    &out_dir,
                    spawn,
                    analog.id,
                    desc.global.step,
                    &desc.global.markers,
                )? {
                    Some(out) => info!("marker file written to {}", out.display()),
                    None => info!("no marker file produced"),
                }
            }
            _ => info!("marker detection skipped (no analog channel or parameters unset)"),
        }
    }

    Ok(())
}
