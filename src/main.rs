use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use log::{error, info};
use num_traits::FromPrimitive;
use toml::Table;

use warpsim::sim::arch::{Arch, ArchConfig};
use warpsim::sim::config::{Config, MemConfig, SimConfig};
use warpsim::sim::dcrs::DCR_BASE_MPM_CLASS;
use warpsim::sim::device::{Device, DeviceError, SimDevice};
use warpsim::sim::perf::MpmClass;
use warpsim::sim::perf_log::dump_perf;
use warpsim::sim::runtime::{dcr_initialize, upload_kernel_file};
use warpsim::sim::top::{ProcessorConfig, RunOutcome};
use warpsim::timeflow::config::{CoreConfig, GfxConfig};
use warpsim::timeflow::gmem::CacheHierarchyConfig;

#[derive(Parser)]
#[command(version, about)]
struct WarpsimArgs {
    #[arg(help = "Path to config.toml")]
    config_path: PathBuf,
    #[arg(long, help = "Override kernel binary path")]
    kernel: Option<PathBuf>,
    #[arg(long, help = "Override the cycle budget")]
    max_cycles: Option<u64>,
    #[arg(long, help = "Counter class to report (0:none 1:core 2:mem 3:tex 4:raster 5:rop)")]
    perf_class: Option<u32>,
    #[arg(long, help = "Write a JSON run summary to this path")]
    perf_json: Option<PathBuf>,
    #[arg(long, help = "Log level, overriding [sim] log_level (0:warn, 1:info, 2:debug, 3:trace)")]
    log: Option<u64>,
}

fn log_filter(level: u64) -> &'static str {
    match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn load_config(path: &Path) -> anyhow::Result<Table> {
    let config = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&config).context("cannot parse config toml")
}

fn run(argv: WarpsimArgs, config_table: Table) -> anyhow::Result<()> {
    let mut sim_config = SimConfig::from_section(config_table.get("sim"));
    let arch_config = ArchConfig::from_section(config_table.get("arch"));
    let core_config = CoreConfig::from_section(config_table.get("core"));
    let gfx_config = GfxConfig::from_section(config_table.get("gfx"));
    let cache_config = CacheHierarchyConfig::from_section(config_table.get("cache"));
    let mem_config = MemConfig::from_section(config_table.get("mem"));

    // override toml configs with argv
    sim_config.kernel = argv.kernel.or(sim_config.kernel);
    sim_config.max_cycles = argv.max_cycles.unwrap_or(sim_config.max_cycles);
    sim_config.perf_class = argv.perf_class.unwrap_or(sim_config.perf_class);

    let arch = Arch::try_from(arch_config).context("inconsistent architecture")?;
    let mut dev = SimDevice::new(ProcessorConfig {
        arch: Arc::new(arch),
        core: Arc::new(core_config),
        gfx: gfx_config,
        caches: cache_config,
        mem: mem_config,
        record_events: sim_config.record_events,
    });

    let Some(kernel) = sim_config.kernel.as_ref() else {
        bail!("no kernel given in [sim] or on the command line");
    };
    let class = MpmClass::from_u32(sim_config.perf_class)
        .with_context(|| format!("unknown perf class {}", sim_config.perf_class))?;

    dcr_initialize(&mut dev)?;
    dev.dcr_write(DCR_BASE_MPM_CLASS, class as u32)?;
    upload_kernel_file(&mut dev, kernel)?;
    dev.start()?;
    let outcome = dev.wait(sim_config.max_cycles)?;

    let summary = dump_perf(&dev, class, &mut io::stdout().lock())?;
    if let Some(path) = argv.perf_json.as_ref() {
        let json = serde_json::to_string_pretty(&summary)?;
        fs::write(path, json).with_context(|| format!("cannot write {}", path.display()))?;
        info!("run summary written to {}", path.display());
    }

    match outcome {
        RunOutcome::Halted(cycles) => {
            info!("kernel halted after {} cycles", cycles);
            Ok(())
        }
        RunOutcome::BudgetExhausted => bail!("cycle budget of {} exhausted", sim_config.max_cycles),
    }
}

pub fn main() {
    let argv = WarpsimArgs::parse();
    let config_table = match load_config(&argv.config_path) {
        Ok(table) => table,
        Err(err) => {
            eprintln!("error: {:#}", err);
            std::process::exit(1);
        }
    };

    let sim_level = SimConfig::try_from_section(config_table.get("sim"))
        .map(|sim| sim.log_level)
        .unwrap_or(0);
    let level = log_filter(argv.log.unwrap_or(sim_level));
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(err) = run(argv, config_table) {
        error!("{:#}", err);
        let code = err.downcast_ref::<DeviceError>().map_or(1, |e| e.code().abs());
        std::process::exit(code);
    }
}
