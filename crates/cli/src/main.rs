//! kl27: command-line front-end for the KL27 virtual CPU.
//!
//! Exit codes: 0 = program halted normally, 1 = loader error, 2 = the CPU
//! errored during execution, 3 = bad arguments.

use clap::{Parser, Subcommand};
use kl27_vm::{Cpu, CpuSnapshot, Instruction, K27Loader, State, TraceEvent};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "kl27")]
#[command(version)]
#[command(about = "Run and inspect K27 programs", long_about = None)]
struct Cli {
    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    logging: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a K27 file until it halts or errors
    Run {
        /// Path to the K27 file
        file: PathBuf,

        /// Stop after this many cycles even if the program is still running
        #[arg(long, value_name = "N")]
        max_steps: Option<u64>,

        /// Print the retained diagnostic rings after the run
        #[arg(long)]
        trace: bool,

        /// Write the diagnostic rings and final state as JSON
        #[arg(long, value_name = "PATH")]
        dump_diag: Option<PathBuf>,
    },

    /// Print the parsed header of a K27 file without executing it
    Info {
        /// Path to the K27 file
        file: PathBuf,
    },

    /// Single-step a K27 file in debugging mode, printing each instruction
    Trace {
        /// Path to the K27 file
        file: PathBuf,

        /// Maximum number of instructions to execute
        #[arg(long, value_name = "N", default_value = "64")]
        steps: u64,
    },
}

/// Diagnostics export written by `run --dump-diag`.
#[derive(Serialize)]
struct DiagDump {
    snapshot: CpuSnapshot,
    instruction_log: Vec<Instruction>,
    trace_log: Vec<TraceEvent>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // clap renders its own message; --help and --version are not
            // argument errors.
            let _ = err.print();
            process::exit(if err.use_stderr() { 3 } else { 0 });
        }
    };

    if let Err(err) = setup_logger(&cli.logging) {
        eprintln!("error: bad --logging value: {err}");
        process::exit(3);
    }

    let code = match cli.command {
        Commands::Run {
            file,
            max_steps,
            trace,
            dump_diag,
        } => run_command(&file, max_steps, trace, dump_diag.as_deref()),
        Commands::Info { file } => info_command(&file),
        Commands::Trace { file, steps } => trace_command(&file, steps),
    };
    process::exit(code);
}

fn setup_logger(level: &str) -> anyhow::Result<()> {
    let level: log::LevelFilter = level.parse()?;
    fern::Dispatch::new()
        .level(level)
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] [{}] {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

fn load_cpu(path: &Path) -> Result<Cpu, i32> {
    Cpu::load(path).map_err(|err| {
        eprintln!("error: failed to load {}: {err}", path.display());
        1
    })
}

fn run_command(file: &Path, max_steps: Option<u64>, trace: bool, dump_diag: Option<&Path>) -> i32 {
    let mut cpu = match load_cpu(file) {
        Ok(cpu) => cpu,
        Err(code) => return code,
    };
    cpu.set_running();

    let mut steps = 0u64;
    while cpu.state() == State::Running {
        if let Some(budget) = max_steps {
            if steps == budget {
                println!("stopped after {budget} cycles with the program still running");
                cpu.halt();
                break;
            }
        }
        if let Err(err) = cpu.step() {
            eprintln!("error: {err}");
            return 2;
        }
        steps += 1;
    }

    print_summary(&cpu);
    if trace {
        print_diagnostics(&cpu);
    }
    if let Some(path) = dump_diag {
        if let Err(err) = dump_diagnostics(&cpu, path) {
            eprintln!("error: failed to write {}: {err}", path.display());
            return 2;
        }
        println!("diagnostics written to {}", path.display());
    }

    if cpu.state() == State::Errored {
        eprintln!(
            "cpu errored: {}",
            cpu.last_error().unwrap_or("unknown error")
        );
        2
    } else {
        0
    }
}

fn info_command(file: &Path) -> i32 {
    let bytes = match fs::read(file) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("error: failed to read {}: {err}", file.display());
            return 1;
        }
    };

    println!("File: {} ({} bytes)", file.display(), bytes.len());

    let loader = match K27Loader::parse(&bytes) {
        Ok(loader) => loader,
        Err(err) => {
            eprintln!("error: {err}");
            return 1;
        }
    };

    println!("Version:     {}", loader.version());
    println!(
        "Compression: {}",
        if loader.compression() == 0 { "raw" } else { "lzma" }
    );
    println!(
        "Entry:       {:#x} (PC {:#x})",
        loader.entry(),
        loader.start_pc()
    );
    println!("Stack size:  {}", loader.stack_size());
    println!(
        "Checksum:    {}",
        if loader.checksum() == [0; 4] {
            "absent".to_string()
        } else {
            format!("{:#010x} (verified)", u32::from_be_bytes(loader.checksum()))
        }
    );
    println!("Labels:      {}", loader.label_count());
    println!("Body:        {} bytes", loader.body_len());
    0
}

fn trace_command(file: &Path, steps: u64) -> i32 {
    let mut cpu = match load_cpu(file) {
        Ok(cpu) => cpu,
        Err(code) => return code,
    };
    cpu.set_debugging();

    let mut executed = 0u64;
    while cpu.state() == State::Debugging && executed < steps {
        let result = match cpu.step() {
            Ok(result) => result,
            Err(err) => {
                eprintln!("error: {err}");
                return 2;
            }
        };
        match result.instruction {
            Some(instr) => println!("{instr}"),
            None => println!("<fetch fault>"),
        }
        executed += 1;
    }

    print_summary(&cpu);
    if cpu.state() == State::Errored {
        eprintln!(
            "cpu errored: {}",
            cpu.last_error().unwrap_or("unknown error")
        );
        2
    } else {
        0
    }
}

fn print_summary(cpu: &Cpu) {
    println!("cycles: {}", cpu.cycle_count());
    println!("state:  {:?}", cpu.state());
    println!("pc:     {:#09x}", cpu.pc());
    for (i, value) in cpu.registers().iter().enumerate() {
        print!("R{i}={value} ");
    }
    println!("MAR={} MVR={}", cpu.mar(), cpu.mvr());
    println!(
        "stack ({}/{}): {:?}",
        cpu.stack().len(),
        cpu.stack_capacity(),
        cpu.stack()
    );
}

fn print_diagnostics(cpu: &Cpu) {
    println!("instruction log:");
    for instr in cpu.instruction_log() {
        println!("  {instr}");
    }
    println!("trace log:");
    for event in cpu.trace_log() {
        println!("  {event:?}");
    }
}

fn dump_diagnostics(cpu: &Cpu, path: &Path) -> anyhow::Result<()> {
    let dump = DiagDump {
        snapshot: cpu.snapshot(),
        instruction_log: cpu.instruction_log(),
        trace_log: cpu.trace_log(),
    };
    fs::write(path, serde_json::to_string_pretty(&dump)?)?;
    Ok(())
}
