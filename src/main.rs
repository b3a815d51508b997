use std::io::Write;
use std::path::PathBuf;

use clap::Parser;

use lprof::cli::{self, MetafileArgs, RecordArgs, ReportArgs};
use lprof::report::HwcMode;
use lprof::{
    prepare_sampling_display, sample, DisplayContext, ElfSymbolProvider, MetafileRequest,
    SampleOptions,
};

fn main() {
    let opt = cli::Opt::parse();

    let default_filter = if opt.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match opt.action {
        cli::Action::Record(record_args) => do_record_action(record_args, opt.verbose),
        cli::Action::Report(report_args) => do_report_action(report_args),
        cli::Action::Metafile(metafile_args) => do_metafile_action(metafile_args),
    }
}

fn do_record_action(args: RecordArgs, verbose: bool) {
    let period = match args.parsed_period() {
        Ok(period) => period,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1)
        }
    };
    let cpu_list = match args.parsed_cpu_list() {
        Ok(cpu_list) => cpu_list,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1)
        }
    };

    let mut options = SampleOptions::new(args.command_line(), &args.experiment);
    options.period = Some(period);
    options.events = args.events.clone();
    options.user_guided = args.user_guided();
    options.backtrace_mode = args.backtrace.into();
    options.cpu_list = cpu_list;
    options.mpi_target = args.mpi_target.clone();
    options.worker_count = args.workers;
    options.engine = args.engine.into();
    options.finalize_signal = args.finalize_signal;
    options.verbose = verbose;
    options.max_buf_mb = args.max_buf_mb;
    options.files_buf_mb = args.files_buf_mb;
    options.max_files_mb = args.max_files_mb;

    match sample(options) {
        Ok(outcome) => {
            eprintln!(
                "Recorded pid {} on {} into {:?} ({} samples, {} lost)",
                outcome.pid,
                outcome.hostname,
                args.experiment,
                outcome.collected,
                outcome.lost
            );
            if outcome.emergency_stop {
                std::process::exit(2)
            }
        }
        Err(err) => {
            eprintln!("Recording failed: {err}");
            std::process::exit(1)
        }
    }
}

fn do_report_action(args: ReportArgs) {
    let period = match args.parsed_period() {
        Ok(period) => period,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1)
        }
    };

    let mut context = DisplayContext::new(&args.experiment);
    context.display_functions = !args.no_functions;
    context.display_loops = !args.no_loops;
    context.callchain_filter = args.callchain_filter.into();
    context.hwc_mode = if args.timer {
        HwcMode::Timer
    } else if args.custom_events {
        HwcMode::CustomEvents
    } else {
        HwcMode::DefaultEvents
    };
    context.cpu_freq = args.cpu_freq;
    context.ref_freq = args.ref_freq;
    context.sampling_period = period;
    context.show_sample_values = args.show_samples;
    context.extended_mode = args.extended;
    for declaration in &args.extra_libs {
        match declaration.split_once('=') {
            Some((library, category)) => {
                context
                    .extra_category_libs
                    .insert(library.to_string(), category.to_string());
            }
            None => {
                eprintln!("--extra-lib expects LIB=CATEGORY, got {declaration:?}");
                std::process::exit(1)
            }
        }
    }

    let tree = match prepare_sampling_display(&context) {
        Ok(tree) => tree,
        Err(err) => {
            eprintln!("Cannot prepare the report: {err}");
            std::process::exit(1)
        }
    };

    let stdout = std::io::stdout();
    let mut writer = std::io::BufWriter::new(stdout.lock());
    if let Err(err) = serde_json::to_writer_pretty(&mut writer, &tree) {
        eprintln!("Cannot serialize the report: {err}");
        std::process::exit(1)
    }
    let _ = writeln!(writer);
}

fn do_metafile_action(args: MetafileArgs) {
    let node_path = args.node.clone().unwrap_or_else(|| {
        let hostname = uname::uname()
            .map(|info| info.nodename)
            .unwrap_or_else(|_| "localhost".to_string());
        PathBuf::from(&args.experiment).join(hostname)
    });

    let request = MetafileRequest {
        experiment_path: args.experiment.clone(),
        node_path,
        pid: args.pid,
        exe_name: args.exe.clone(),
        disass_list: args.disass_list.clone(),
    };
    let mut disassembler = ElfSymbolProvider;
    if let Err(err) = lprof::generate_metafile(&request, &mut disassembler) {
        eprintln!("Metadata generation failed: {err}");
        std::process::exit(1)
    }
}
