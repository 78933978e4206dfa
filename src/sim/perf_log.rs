//! External read path for the performance counters: everything here goes through the `Device`
//! interface and the memory-mapped CSR region, never through the registry directly.

use std::collections::BTreeMap;
use std::io::Write;

use serde::Serialize;

use crate::sim::device::{Device, DeviceCap, DeviceError};
use crate::sim::perf::{csr, csr_64, MpmClass, StagingBuffer, CSR_REGION_SIZE, IO_CSR_ADDR, NAMED_COUNTERS};

/// `1 - misses/accesses` in integer percent; 0 without accesses.
pub fn hit_ratio(misses: u64, accesses: u64) -> u64 {
    if accesses == 0 {
        return 0;
    }
    ((1.0 - misses as f64 / accesses as f64) * 100.0) as u64
}

/// `accesses/(accesses+stalls)` in integer percent; 0 when both are zero.
pub fn utilization(accesses: u64, stalls: u64) -> u64 {
    let total = accesses + stalls;
    if total == 0 {
        return 0;
    }
    (accesses as f64 / total as f64 * 100.0) as u64
}

/// Average cycles per request; 0 without requests.
pub fn avg_latency(sum: u64, requests: u64) -> u64 {
    if requests == 0 {
        return 0;
    }
    sum / requests
}

fn ipc(instrs: u64, cycles: u64) -> f64 {
    if cycles == 0 {
        0.0
    } else {
        instrs as f64 / cycles as f64
    }
}

fn num_cores(dev: &impl Device) -> Result<usize, DeviceError> {
    Ok(dev.dev_caps(DeviceCap::NumCores as u32)? as usize)
}

/// Copy one core's staging buffer out of the CSR region.
pub fn read_staging(dev: &impl Device, core_id: usize) -> Result<StagingBuffer, DeviceError> {
    let mut bytes = [0u8; CSR_REGION_SIZE as usize];
    dev.copy_from_dev(IO_CSR_ADDR + core_id as u64 * CSR_REGION_SIZE, &mut bytes)?;
    let mut buf = [0u32; 64];
    for (word, chunk) in buf.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(buf)
}

/// Read a 64-bit counter of one core, or aggregate it over all cores: the cycle counter by
/// maximum, everything else by sum.
pub fn perf_counter(dev: &impl Device, csr_addr: u32, core: Option<usize>) -> Result<u64, DeviceError> {
    let cores = num_cores(dev)?;
    match core {
        Some(core_id) if core_id >= cores => Err(DeviceError::CoreOutOfRange(core_id)),
        Some(core_id) => Ok(csr_64(&read_staging(dev, core_id)?, csr_addr)),
        None => {
            let values = (0..cores)
                .map(|core_id| Ok(csr_64(&read_staging(dev, core_id)?, csr_addr)))
                .collect::<Result<Vec<u64>, DeviceError>>()?;
            Ok(aggregate(csr_addr, &values))
        }
    }
}

/// Combine per-core values of one counter.
pub fn aggregate(csr_addr: u32, values: &[u64]) -> u64 {
    if csr_addr == csr::MCYCLE {
        values.iter().copied().max().unwrap_or(0)
    } else {
        values.iter().sum()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CoreReport {
    pub core_id: usize,
    pub instrs: u64,
    pub cycles: u64,
    pub ipc: f64,
    pub counters: BTreeMap<String, u64>,
    pub derived: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub perf_class: MpmClass,
    pub cores: Vec<CoreReport>,
    pub total: CoreReport,
}

fn class_counters(class: MpmClass) -> Vec<(&'static str, u32)> {
    let mut names: Vec<_> = NAMED_COUNTERS
        .entries()
        .filter(|(_, (c, _))| *c == class && class != MpmClass::None)
        .map(|(name, (_, addr))| (*name, *addr))
        .collect();
    names.sort_by_key(|(_, addr)| *addr);
    names
}

fn derive_metrics(class: MpmClass, c: &BTreeMap<String, u64>) -> BTreeMap<String, u64> {
    let get = |name: &str| c.get(name).copied().unwrap_or(0);
    let mut out = BTreeMap::new();
    let mut put = |name: &str, value: u64| {
        out.insert(name.to_string(), value);
    };
    match class {
        MpmClass::None => {}
        MpmClass::Core => {
            put("ifetch_latency", avg_latency(get("ifetch_lat"), get("ifetches")));
            put("load_latency", avg_latency(get("load_lat"), get("loads")));
        }
        MpmClass::Mem => {
            put("icache_read_hit_ratio", hit_ratio(get("icache_read_misses"), get("icache_reads")));
            for level in ["dcache", "l2cache", "l3cache"] {
                let reads = get(&format!("{level}_reads"));
                let writes = get(&format!("{level}_writes"));
                put(
                    &format!("{level}_read_hit_ratio"),
                    hit_ratio(get(&format!("{level}_read_misses")), reads),
                );
                put(
                    &format!("{level}_write_hit_ratio"),
                    hit_ratio(get(&format!("{level}_write_misses")), writes),
                );
                put(
                    &format!("{level}_bank_utilization"),
                    utilization(reads + writes, get(&format!("{level}_bank_stalls"))),
                );
            }
            put(
                "smem_bank_utilization",
                utilization(get("smem_reads") + get("smem_writes"), get("smem_bank_stalls")),
            );
            put("mem_latency", avg_latency(get("mem_lat"), get("mem_reads")));
        }
        MpmClass::Tex => put("tex_latency", avg_latency(get("tex_lat"), get("tex_reads"))),
        MpmClass::Raster => put("raster_latency", avg_latency(get("raster_lat"), get("raster_reads"))),
        MpmClass::Rop => put(
            "rop_latency",
            avg_latency(get("rop_lat"), get("rop_reads") + get("rop_writes")),
        ),
    }
    out
}

fn write_report(out: &mut impl Write, prefix: &str, report: &CoreReport) -> std::io::Result<()> {
    writeln!(
        out,
        "PERF: {}instrs={}, cycles={}, IPC={:.6}",
        prefix, report.instrs, report.cycles, report.ipc
    )?;
    for (name, value) in report.counters.iter() {
        writeln!(out, "PERF: {prefix}{name}={value}")?;
    }
    for (name, value) in report.derived.iter() {
        let unit = if name.ends_with("latency") { " cycles" } else { "%" };
        writeln!(out, "PERF: {prefix}{name}={value}{unit}")?;
    }
    Ok(())
}

/// Read every core's CSR region and print `PERF:` lines for `class`. Per-core lines are only
/// printed when there is more than one core. Nothing is written if any read fails.
pub fn dump_perf(dev: &impl Device, class: MpmClass, out: &mut impl Write) -> Result<RunSummary, DeviceError> {
    let cores = num_cores(dev)?;
    let counters = class_counters(class);

    let mut reports = Vec::with_capacity(cores);
    for core_id in 0..cores {
        let buf = read_staging(dev, core_id)?;
        let instrs = csr_64(&buf, csr::MINSTRET);
        let cycles = csr_64(&buf, csr::MCYCLE);
        let values: BTreeMap<String, u64> = counters
            .iter()
            .map(|(name, addr)| (name.to_string(), csr_64(&buf, *addr)))
            .collect();
        reports.push(CoreReport {
            core_id,
            instrs,
            cycles,
            ipc: ipc(instrs, cycles),
            derived: derive_metrics(class, &values),
            counters: values,
        });
    }

    let instrs = aggregate(csr::MINSTRET, &reports.iter().map(|r| r.instrs).collect::<Vec<_>>());
    let cycles = aggregate(csr::MCYCLE, &reports.iter().map(|r| r.cycles).collect::<Vec<_>>());
    let mut totals = BTreeMap::new();
    for (name, addr) in counters.iter() {
        let values: Vec<u64> = reports.iter().map(|r| r.counters[*name]).collect();
        totals.insert(name.to_string(), aggregate(*addr, &values));
    }
    let total = CoreReport {
        core_id: 0,
        instrs,
        cycles,
        ipc: ipc(instrs, cycles),
        derived: derive_metrics(class, &totals),
        counters: totals,
    };

    if cores > 1 {
        for report in reports.iter() {
            write_report(out, &format!("core{}: ", report.core_id), report)?;
        }
    }
    write_report(out, "", &total)?;

    Ok(RunSummary {
        perf_class: class,
        cores: reports,
        total,
    })
}
