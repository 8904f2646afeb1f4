//! Kernel entry point.
//!
//! Brings up logging, hands the physical frame allocator its managed RAM
//! region, and demonstrates the allocator by carving out a few pages. The
//! boot collaborator that discovers `ram_base`/`ram_size` and establishes
//! the physmap window is out of scope here; this file stubs it with
//! placeholder values a real bootloader handoff would replace.

#![no_std]
#![no_main]
#![allow(unsafe_code)]

use core::fmt::Write as _;
use core::panic::PanicInfo;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_log::{KernelLogger, LogSink};
use kernel_memory_addresses::PhysicalAddress;
use kernel_pfa::{PageType, PfaInitArgs};
use log::LevelFilter;

/// Direct-mapped view of physical RAM at a fixed per-boot offset.
///
/// A real boot path establishes this window (and its base) while setting
/// up the kernel's own page tables; constructing it is outside this
/// crate's scope, so `base` is simply a runtime parameter here.
struct OffsetPhysMap {
    base: u64,
}

unsafe impl Sync for OffsetPhysMap {}

impl kernel_pfa::PhysMap for OffsetPhysMap {
    fn pa_to_kva(&self, pa: PhysicalAddress) -> NonNull<u8> {
        NonNull::new((pa.as_u64() + self.base) as *mut u8).expect("physmap produced a null pointer")
    }

    fn kva_to_pa(&self, kva: NonNull<u8>) -> PhysicalAddress {
        PhysicalAddress::new(kva.as_ptr() as u64 - self.base)
    }
}

static PHYS_MAP: OffsetPhysMap = OffsetPhysMap { base: 0xFFFF_8000_0000_0000 };

/// Placeholder console sink. A real board wires this to a UART or
/// hypervisor debug port; here it just discards bytes so the crate is
/// self-contained without a concrete console driver.
struct NullSink;
impl LogSink for NullSink {
    fn write_str(&self, _s: &str) {}
}
static NULL_SINK: NullSink = NullSink;

/// Bumped once per boot so the OOM-sweep test pattern (if exercised at
/// runtime) can distinguish successive runs; unused outside diagnostics.
static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

#[unsafe(no_mangle)]
pub extern "C" fn kernel_main() -> ! {
    KernelLogger::new(&NULL_SINK, LevelFilter::Info)
        .init()
        .expect("logger installed exactly once during boot");

    let run = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    log::info!("kernel: boot run {run}");

    let args = PfaInitArgs {
        ram_base: PhysicalAddress::new(0x0010_0000),
        ram_size: 64 * 1024 * 1024,
        kernel_text_base: PhysicalAddress::new(0x0010_0000),
        kernel_text_size: 256 * 1024,
        kernel_data_base: PhysicalAddress::new(0x0014_0000),
        kernel_data_size: 256 * 1024,
        bootstrap_pa_reserved: PhysicalAddress::new(0x0018_0000),
    };

    // SAFETY: `PHYS_MAP` covers the full `ram_base..ram_base+ram_size`
    // range declared in `args`, and `kernel_main` runs once, single core,
    // before any other PFA caller exists.
    let pfa = unsafe { kernel_pfa::init(&PHYS_MAP, args) }.expect("pfa init failed");

    let page = pfa.alloc_contig(4096, PageType::KernelData);
    if page != kernel_pfa::PHYS_ADDR_INVALID {
        log::info!("kernel: allocated page at {page:?}");
        pfa.free_contig(page, 4096);
    }

    halt()
}

fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut sink = PanicSink;
    let _ = writeln!(sink, "\n*** KERNEL PANIC ***");
    if let Some(location) = info.location() {
        let _ = writeln!(sink, "at {}:{}:{}", location.file(), location.line(), location.column());
    }
    let _ = writeln!(sink, "{}", info.message());
    // A board-specific indicator (e.g. lighting an LED through the
    // VideoCore mailbox on Raspberry Pi) belongs here; it is an external
    // collaborator this crate does not own.
    halt()
}

struct PanicSink;
impl core::fmt::Write for PanicSink {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        NULL_SINK.write_str(s);
        Ok(())
    }
}
