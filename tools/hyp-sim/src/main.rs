mod host;

use host::{SimCpus, SimHost, SimServices};
use hyp_alloc::phys_mapper::SimulatedMemory;
use hyp_console::{CONSOLE_BYTES, ConsoleLogger};
use hyp_info::boot::{BootParams, GuardianImage, PerCpuParams, Platform};
use hyp_info::memory::PAGE_SIZE;
use hyp_memory_addresses::{PhysRange, PhysicalAddress, VirtualAddress};
use hyp_setup::{Transition, bootstrap, enter_host};
use std::process::ExitCode;
use std::{env, io::Write};

static CONSOLE: ConsoleLogger = ConsoleLogger::new(log::LevelFilter::Info);

const MEMORY_BASE: u64 = 0x4000_0000;
/// Image, per-CPU data and host pages sit below the pool.
const POOL_BASE: u64 = 0x4100_0000;
const PER_CPU_BASE: u64 = 0x4010_0000;
const PER_CPU_SIZE: u64 = 0x2000;
const STACK_BASE: u64 = 0x4018_0000;
const MAX_CPUS: usize = 64;

fn range(base: u64, pages: u64) -> PhysRange {
    PhysRange::from_pages(PhysicalAddress::new(base), pages).unwrap_or_else(|| {
        eprintln!("bad range {base:#x}+{pages}");
        std::process::exit(2)
    })
}

fn arg<T: std::str::FromStr>(args: &mut impl Iterator<Item = String>, default: T, name: &str) -> T {
    args.next().map_or(Ok(default), |a| a.parse()).unwrap_or_else(|_| {
        eprintln!("usage: hyp-sim [pool_pages] [cpu_count] [va_bits]  (bad {name})");
        std::process::exit(2)
    })
}

fn main() -> ExitCode {
    // args: [pool_pages] [cpu_count] [va_bits]
    let mut args = env::args().skip(1);
    let pool_pages: u64 = arg(&mut args, 4096, "pool_pages");
    let cpu_count: usize = arg(&mut args, 4, "cpu_count");
    let va_bits: u8 = arg(&mut args, 40, "va_bits");
    if cpu_count == 0 || cpu_count > MAX_CPUS || !(36..=48).contains(&va_bits) {
        eprintln!("cpu_count must be 1..={MAX_CPUS} and va_bits 36..=48");
        return ExitCode::from(2);
    }

    if let Err(e) = CONSOLE.init() {
        eprintln!("console: {e}");
    }
    hyp_console::hyp_trace!(CONSOLE, "hyp-sim: {pool_pages} pool pages, {cpu_count} cpus, {va_bits}-bit VA\n");

    // Memory covers the low area plus the pool, rounded up to 2 MiB.
    let pool_bytes = pool_pages * PAGE_SIZE;
    let memory_size = (POOL_BASE - MEMORY_BASE + pool_bytes).next_multiple_of(2 << 20);
    let memory = [range(MEMORY_BASE, memory_size / PAGE_SIZE)];
    let host_shared = [range(0x4002_0000, 2)];
    let protected = [range(0x4080_0000, 16)];
    let mem = SimulatedMemory::new(&memory);

    let platform = Platform {
        memory: &memory,
        image: GuardianImage {
            text: range(0x4000_0000, 16),
            rodata: range(0x4001_0000, 8),
            data: range(0x4001_8000, 4),
            bss: range(0x4001_c000, 4),
            idmap: range(0x4000_0000, 1),
            host_shared: &host_shared,
            firmware: Some(range(0x4003_0000, 4)),
        },
        protected: &protected,
        linear_map_offset: 1 << (va_bits - 1),
        private_va_base: VirtualAddress::new(1 << (va_bits - 2)),
        per_cpu_size: PER_CPU_SIZE,
    };
    let mut cpus: Vec<PerCpuParams> = (0..cpu_count as u64)
        .map(|cpu| PerCpuParams {
            base: PhysicalAddress::new(PER_CPU_BASE + cpu * PER_CPU_SIZE),
            stack_pa: PhysicalAddress::new(STACK_BASE + cpu * PAGE_SIZE),
            ..PerCpuParams::default()
        })
        .collect();
    let params = BootParams {
        phys_base: PhysicalAddress::new(POOL_BASE),
        size: pool_bytes,
        cpu_count,
        per_cpu: &mut cpus,
        va_bits,
        platform,
    };

    let mut host_cpus = SimCpus::default();
    let mut services = SimServices::default();
    let mut host = SimHost::new(&mem, &memory);
    let (transition, reserved) = match bootstrap(params, &mem) {
        Ok(ctx) => {
            let reserved = ctx.reserved_pages();
            (ctx.finalize(&mut host, &mut services), Some(reserved))
        }
        Err(e) => (Transition::Abort(e), None),
    };
    let guardian = enter_host(&mut host_cpus, transition);

    dump_console();
    println!("---");
    println!("return code:  {}", host_cpus.return_code.unwrap_or_default());
    println!("cpus released: {}", host_cpus.released);
    if let Some(reserved) = reserved {
        println!("pool:         {pool_pages} pages, {reserved} reserved");
    }
    for (cpu, params) in cpus.iter().enumerate() {
        println!(
            "cpu {cpu}:        stack top {:?}, pgd {:?}",
            params.stack_hyp_va, params.pgd_pa
        );
    }
    let Some(guardian) = guardian else {
        return ExitCode::FAILURE;
    };
    println!("free pages:   {}", guardian.free_pages());
    if let Some(mailboxes) = services.mailboxes {
        println!("mailboxes:    {mailboxes:?}");
    }
    drop(guardian);
    println!(
        "host gave away: {} pages to the guardian, {} protected",
        host.pages_to[1], host.pages_to[2]
    );
    ExitCode::SUCCESS
}

fn dump_console() {
    let mut buf = vec![0u8; CONSOLE_BYTES];
    let n = CONSOLE.drain(&mut buf);
    let mut out = std::io::stdout().lock();
    if CONSOLE.lost() > 0 {
        let _ = writeln!(out, "({} console bytes lost)", CONSOLE.lost());
    }
    let _ = out.write_all(&buf[..n]);
}
