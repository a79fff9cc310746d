//! Virtual-memory manager
//!
//! Owns every address space in the system. The kernel's *main* space maps
//! MMIO as RW gigapages, the kernel image with per-section permissions,
//! the heap window as global 4 KiB pages and the rest of RAM as global RW
//! megapages. Per-process user spaces share all of those global mappings
//! and own the user half: a fresh root, a fresh gigarange-2 level-1 table
//! and a fresh level-0 table for the kernel megapage window.
//!
//! An address space is named by its `mtag`, the raw `satp` value
//! combining the Sv39 mode bits with the root-table frame number.
//!
//! Page-table walks refuse megapage and gigapage leaves, so user mappings
//! can only be created where the walk reaches level 0; the globally
//! megapage-mapped page pool is therefore never shadowed by user pages
//! and every pooled frame stays reachable through its identity address in
//! every space.

use core::cell::UnsafeCell;

use riscv::register::{satp, sstatus};

use super::{
    frame_allocator,
    page_table::{PageTable, Pte, PteFlags, vpn},
    GIGA_SIZE, HEAP_INIT_MIN, MEGA_SIZE, PAGE_SIZE, RAM_END, RAM_SIZE, RAM_START, USER_END_VMA,
    USER_START_VMA,
    is_aligned, round_down, round_up, wellformed_vma,
};
use crate::error::{KernelError, KernelResult};

// Linker-provided section boundaries (see arch/riscv64/link.ld).
extern "C" {
    static _kimg_start: u8;
    static _kimg_text_start: u8;
    static _kimg_text_end: u8;
    static _kimg_rodata_start: u8;
    static _kimg_rodata_end: u8;
    static _kimg_data_start: u8;
    static _kimg_end: u8;
}

macro_rules! kimg_sym {
    ($name:ident) => {{
        // SAFETY: The symbol is defined by the linker script; only its
        // address is taken, the byte itself is never read.
        unsafe { core::ptr::addr_of!($name) as usize }
    }};
}

/// Statically allocated kernel page table, shared by every address space
/// through global entries.
#[repr(transparent)]
struct TableCell(UnsafeCell<PageTable>);

// SAFETY: The tables are mutated only during `init` (single-threaded
// boot) and afterwards only through `walk` under interrupt-disabled
// critical sections on a single hart.
unsafe impl Sync for TableCell {}

impl TableCell {
    const fn new() -> Self {
        Self(UnsafeCell::new(PageTable::new()))
    }

    fn ptr(&self) -> *mut PageTable {
        self.0.get()
    }
}

#[link_section = ".bss.pagetable"]
static MAIN_PT2: TableCell = TableCell::new();
#[link_section = ".bss.pagetable"]
static MAIN_PT1: TableCell = TableCell::new();
#[link_section = ".bss.pagetable"]
static MAIN_PT0: TableCell = TableCell::new();

/// An address space name: the raw `satp` value (mode + root PPN).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mtag(usize);

const SATP_MODE_SV39: usize = 8;

impl Mtag {
    fn from_root(root_pa: usize) -> Self {
        Self((SATP_MODE_SV39 << 60) | (root_pa >> super::PAGE_ORDER))
    }

    pub fn bits(self) -> usize {
        self.0
    }

    fn root(self) -> *mut PageTable {
        ((self.0 & ((1usize << 44) - 1)) << super::PAGE_ORDER) as *mut PageTable
    }
}

static mut MAIN_MTAG: usize = 0;

/// The kernel's main address space.
pub fn main_mtag() -> Mtag {
    // SAFETY: MAIN_MTAG is written once during `init` before any other
    // thread exists and never changes afterwards.
    Mtag(unsafe { MAIN_MTAG })
}

/// The currently installed address space.
pub fn active_mtag() -> Mtag {
    Mtag(satp::read().bits())
}

/// Install an address space and flush the TLB.
pub fn install(mtag: Mtag) {
    let ppn = mtag.bits() & ((1usize << 44) - 1);
    // SAFETY: mtag names a root table whose global entries cover the
    // kernel image, so execution continues seamlessly after the write.
    unsafe {
        satp::set(satp::Mode::Sv39, 0, ppn);
        riscv::asm::sfence_vma_all();
    }
}

fn active_root() -> *mut PageTable {
    active_mtag().root()
}

fn sfence() {
    // SAFETY: sfence.vma orders the preceding PTE stores before any
    // subsequent translation.
    unsafe {
        riscv::asm::sfence_vma_all();
    }
}

/// Build the main address space, enable paging, hand the heap window to
/// the allocator and stock the page pool.
///
/// Panics if the kernel image does not fit in one 2 MiB megapage.
pub fn init() {
    let kimg_start = kimg_sym!(_kimg_start);
    let kimg_end = kimg_sym!(_kimg_end);
    let text_start = kimg_sym!(_kimg_text_start);
    let text_end = kimg_sym!(_kimg_text_end);
    let rodata_start = kimg_sym!(_kimg_rodata_start);
    let rodata_end = kimg_sym!(_kimg_rodata_end);
    let data_start = kimg_sym!(_kimg_data_start);

    assert_eq!(kimg_start, RAM_START);

    crate::println!(
        "           RAM: [{:#x},{:#x}): {} MB",
        RAM_START,
        RAM_END,
        RAM_SIZE / 1024 / 1024
    );
    crate::println!("  Kernel image: [{:#x},{:#x})", kimg_start, kimg_end);

    if kimg_end - kimg_start > MEGA_SIZE {
        panic!("Kernel too large");
    }

    // SAFETY: Boot is single-threaded and paging is still off; the static
    // tables are written through their identity addresses.
    let (pt2, pt1, pt0) = unsafe {
        (
            &mut *MAIN_PT2.ptr(),
            &mut *MAIN_PT1.ptr(),
            &mut *MAIN_PT0.ptr(),
        )
    };

    // Identity map the MMIO space below RAM as RW gigapages.
    let mut pma = 0;
    while pma < RAM_START {
        pt2[vpn(pma, 2)] = Pte::leaf(pma, PteFlags::R | PteFlags::W | PteFlags::G);
        pma += GIGA_SIZE;
    }

    // The gigarange holding RAM gets a second-level table.
    pt2[vpn(RAM_START, 2)] = Pte::table(MAIN_PT1.ptr() as usize, PteFlags::G);

    // First megarange of RAM: individual pages with permissions following
    // the kernel image sections.
    pt1[vpn(RAM_START, 1)] = Pte::table(MAIN_PT0.ptr() as usize, PteFlags::G);

    let mut pp = text_start;
    while pp < text_end {
        pt0[vpn(pp, 0)] = Pte::leaf(pp, PteFlags::R | PteFlags::X | PteFlags::G);
        pp += PAGE_SIZE;
    }
    let mut pp = rodata_start;
    while pp < rodata_end {
        pt0[vpn(pp, 0)] = Pte::leaf(pp, PteFlags::R | PteFlags::G);
        pp += PAGE_SIZE;
    }
    // Data, heap and the sub-megapage page pool, up to the user window.
    let mut pp = data_start;
    while pp < USER_START_VMA {
        pt0[vpn(pp, 0)] = Pte::leaf(pp, PteFlags::R | PteFlags::W | PteFlags::G);
        pp += PAGE_SIZE;
    }

    // Remaining RAM mapped as global RW megapages.
    let mut pp = RAM_START + MEGA_SIZE;
    while pp < RAM_END {
        pt1[vpn(pp, 1)] = Pte::leaf(pp, PteFlags::R | PteFlags::W | PteFlags::G);
        pp += MEGA_SIZE;
    }

    let mtag = Mtag::from_root(MAIN_PT2.ptr() as usize);
    // SAFETY: MAIN_MTAG is written once here, before any other thread
    // exists.
    unsafe {
        MAIN_MTAG = mtag.bits();
    }
    install(mtag);

    // Let supervisor loads/stores reach validated user pages.
    // SAFETY: SUM only widens what the kernel may access; user pointers
    // are still validated before every dereference.
    unsafe {
        sstatus::set_sum();
    }

    // Heap window between the image and the user region.
    let heap_start = round_up(kimg_end, PAGE_SIZE);
    let heap_end = heap_start + HEAP_INIT_MIN;
    if heap_end > USER_START_VMA {
        panic!("Not enough memory below the user window");
    }
    crate::init_heap(heap_start, heap_end - heap_start);
    crate::println!(
        "Heap allocator: [{:#x},{:#x}): {} KB free",
        heap_start,
        heap_end,
        (heap_end - heap_start) / 1024
    );

    // Stock the page pool: the rest of the kernel megapage window, plus
    // all megapage-mapped RAM. Frames whose identity address would fall
    // inside the user window are not pooled.
    frame_allocator::add_range(heap_end, USER_START_VMA);
    frame_allocator::add_range(RAM_START + MEGA_SIZE, RAM_END);
    crate::println!(
        "Page allocator: {} pages free",
        frame_allocator::free_count()
    );
}

/// Descend the three-level table for the 4 KiB page holding `vma`.
///
/// With `create`, missing intermediate tables are allocated (zeroed,
/// installed with V only). Fails if the walk meets a leaf above level 0;
/// mega- and gigapages are never split.
///
/// # Safety
///
/// `root` must point to a live root table, and the caller must hold off
/// concurrent mutation of the same tables (interrupts disabled or boot
/// context).
unsafe fn walk(root: *mut PageTable, vma: usize, create: bool) -> KernelResult<*mut Pte> {
    let mut table = root;
    for level in [2usize, 1] {
        // SAFETY: `table` is a live page table per the caller contract;
        // indexes are masked to 0..512.
        let entry = unsafe { &mut (&mut *table)[vpn(vma, level)] };
        if entry.is_valid() {
            if entry.is_leaf() {
                // Mega/gigapage in the way; not supported for user space.
                return Err(KernelError::InvalidAddress { addr: vma });
            }
            table = entry.addr() as *mut PageTable;
        } else if create {
            let frame = frame_allocator::alloc_page_zeroed()
                .ok_or(KernelError::OutOfMemory { requested: PAGE_SIZE })?;
            *entry = Pte::table(frame, PteFlags::empty());
            table = frame as *mut PageTable;
        } else {
            return Err(KernelError::UnmappedMemory { addr: vma });
        }
    }
    // SAFETY: `table` now points at the level-0 table for `vma`.
    Ok(unsafe { &mut (&mut *table)[vpn(vma, 0)] } as *mut Pte)
}

/// Allocate a frame and map it at `vma` in the active space.
///
/// `vma` must be well-formed and page-aligned, and must not already be
/// mapped; callers validate before mapping.
pub fn alloc_and_map_page(vma: usize, flags: PteFlags) -> KernelResult<()> {
    if !wellformed_vma(vma) || !is_aligned(vma, PAGE_SIZE) {
        return Err(KernelError::InvalidAddress { addr: vma });
    }
    let frame = frame_allocator::alloc_page_zeroed()
        .ok_or(KernelError::OutOfMemory { requested: PAGE_SIZE })?;

    // SAFETY: Mutation of the active tables is serialized by the callers
    // (interrupt-disabled sections or single-threaded paths).
    let pte = match unsafe { walk(active_root(), vma, true) } {
        Ok(pte) => pte,
        Err(e) => {
            frame_allocator::free_page(frame);
            return Err(e);
        }
    };
    // SAFETY: `pte` points into a live level-0 table.
    unsafe {
        if (*pte).is_valid() {
            frame_allocator::free_page(frame);
            return Err(KernelError::InvalidAddress { addr: vma });
        }
        *pte = Pte::leaf(frame, flags);
    }
    sfence();
    Ok(())
}

/// Map every page covering `[vma, vma + size)`, rolling back the pages
/// mapped by this call on failure.
pub fn alloc_and_map_range(vma: usize, size: usize, flags: PteFlags) -> KernelResult<()> {
    let start = round_down(vma, PAGE_SIZE);
    let end = round_up(vma + size, PAGE_SIZE);
    let mut page = start;
    while page < end {
        if let Err(e) = alloc_and_map_page(page, flags) {
            let mut undo = start;
            while undo < page {
                unmap_and_free_page(undo);
                undo += PAGE_SIZE;
            }
            return Err(e);
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

/// Unmap the page at `vma` in the active space and free its frame.
fn unmap_and_free_page(vma: usize) {
    // SAFETY: Serialized like every other table mutation.
    if let Ok(pte) = unsafe { walk(active_root(), vma, false) } {
        // SAFETY: `pte` points into a live level-0 table.
        unsafe {
            if (*pte).is_leaf() {
                frame_allocator::free_page((*pte).addr());
                (*pte).clear();
            }
        }
    }
    sfence();
}

/// Rewrite the permission bits of every mapped page in the range.
pub fn set_range_flags(vma: usize, size: usize, flags: PteFlags) -> KernelResult<()> {
    let start = round_down(vma, PAGE_SIZE);
    let end = round_up(vma + size, PAGE_SIZE);
    let mut page = start;
    while page < end {
        // SAFETY: Serialized like every other table mutation.
        let pte = unsafe { walk(active_root(), page, false) }?;
        // SAFETY: `pte` points into a live level-0 table.
        unsafe {
            if !(*pte).is_leaf() {
                return Err(KernelError::UnmappedMemory { addr: page });
            }
            *pte = (*pte).with_flags(flags);
        }
        page += PAGE_SIZE;
    }
    sfence();
    Ok(())
}

/// True iff every page touched by `[ptr, ptr + len)` is well-formed,
/// mapped, and its leaf PTE contains all bits in `required`.
pub fn validate_user_ptr(ptr: usize, len: usize, required: PteFlags) -> bool {
    if len == 0 {
        return wellformed_vma(ptr);
    }
    let end = match ptr.checked_add(len) {
        Some(end) => end,
        None => return false,
    };
    let mut page = round_down(ptr, PAGE_SIZE);
    while page < end {
        if !wellformed_vma(page) {
            return false;
        }
        // SAFETY: Read-only walk of the active tables.
        let pte = match unsafe { walk(active_root(), page, false) } {
            Ok(pte) => pte,
            Err(_) => return false,
        };
        // SAFETY: `pte` points into a live level-0 table.
        let ok = unsafe { (*pte).is_leaf() && (*pte).flags().contains(required) };
        if !ok {
            return false;
        }
        page += PAGE_SIZE;
    }
    true
}

/// Walk a user C string, revalidating on every page crossing. Returns the
/// string length (bytes before the terminator), or `None` if any touched
/// page fails validation.
pub fn validate_user_cstr(ptr: usize, required: PteFlags) -> Option<usize> {
    let mut addr = ptr;
    loop {
        if addr == ptr || is_aligned(addr, PAGE_SIZE) {
            if !validate_user_ptr(addr, 1, required) {
                return None;
            }
        }
        // SAFETY: The containing page was just validated as mapped with
        // the required flags; SUM is set, so the supervisor may read it.
        let byte = unsafe { core::ptr::read_volatile(addr as *const u8) };
        if byte == 0 {
            return Some(addr - ptr);
        }
        addr += 1;
    }
}

/// Service a page fault at `vma`: demand-map one RWU page.
///
/// Only well-formed, user-region addresses are accepted; anything else
/// panics, as does frame exhaustion here.
pub fn handle_page_fault(vma: usize) {
    if !wellformed_vma(vma) {
        panic!("page fault at malformed address {:#x}", vma);
    }
    if !(USER_START_VMA..USER_END_VMA).contains(&vma) {
        panic!("page fault outside user region at {:#x}", vma);
    }
    let page = round_down(vma, PAGE_SIZE);
    if let Err(e) = alloc_and_map_page(page, PteFlags::R | PteFlags::W | PteFlags::U) {
        panic!("page fault at {:#x}: {}", vma, e);
    }
}

/// Create a fresh user address space sharing the kernel's global
/// mappings: copied gigapage leaves, shared megapage pool leaves, and a
/// copied kernel-window level-0 table (global entries only).
pub fn new_user_space() -> KernelResult<Mtag> {
    let root_pa = frame_allocator::alloc_page_zeroed()
        .ok_or(KernelError::OutOfMemory { requested: PAGE_SIZE })?;
    let pt1_pa = match frame_allocator::alloc_page_zeroed() {
        Some(pa) => pa,
        None => {
            frame_allocator::free_page(root_pa);
            return Err(KernelError::OutOfMemory { requested: PAGE_SIZE });
        }
    };
    let pt0_pa = match frame_allocator::alloc_page_zeroed() {
        Some(pa) => pa,
        None => {
            frame_allocator::free_page(root_pa);
            frame_allocator::free_page(pt1_pa);
            return Err(KernelError::OutOfMemory { requested: PAGE_SIZE });
        }
    };

    // SAFETY: The three fresh frames are exclusively owned here; the main
    // tables are only read. All are identity-mapped.
    unsafe {
        let root = &mut *(root_pa as *mut PageTable);
        let pt1 = &mut *(pt1_pa as *mut PageTable);
        let pt0 = &mut *(pt0_pa as *mut PageTable);
        let main_pt2 = &*MAIN_PT2.ptr();
        let main_pt1 = &*MAIN_PT1.ptr();
        let main_pt0 = &*MAIN_PT0.ptr();

        for idx in 0..vpn(RAM_START, 2) {
            root[idx] = main_pt2[idx];
        }
        root[vpn(RAM_START, 2)] = Pte::table(pt1_pa, PteFlags::empty());

        for idx in 0..512 {
            let entry = main_pt1[idx];
            // Shared megapage leaves carry G; per-space user tables and
            // the kernel-window table pointer are rebuilt below.
            if entry.is_leaf() && entry.flags().contains(PteFlags::G) {
                pt1[idx] = entry;
            }
        }
        pt1[vpn(RAM_START, 1)] = Pte::table(pt0_pa, PteFlags::empty());

        for idx in 0..512 {
            let entry = main_pt0[idx];
            if entry.is_leaf() && !entry.flags().contains(PteFlags::U) {
                pt0[idx] = entry;
            }
        }
    }

    Ok(Mtag::from_root(root_pa))
}

/// Visit every user (U-flagged) leaf reachable from `root` within the
/// user region, including the stack page.
///
/// # Safety
///
/// `root` must be a live root table and mutation must be serialized by
/// the caller.
unsafe fn for_each_user_leaf(root: *mut PageTable, mut f: impl FnMut(usize, &mut Pte)) {
    // SAFETY: Caller contract.
    let root = unsafe { &mut *root };
    let giga_entry = root[vpn(RAM_START, 2)];
    if !giga_entry.is_table() {
        return;
    }
    // SAFETY: Table entries always reference live, identity-mapped tables.
    let pt1 = unsafe { &mut *(giga_entry.addr() as *mut PageTable) };
    for idx1 in 0..512 {
        let entry1 = pt1[idx1];
        if !entry1.is_table() {
            continue;
        }
        // SAFETY: As above.
        let pt0 = unsafe { &mut *(entry1.addr() as *mut PageTable) };
        for idx0 in 0..512 {
            let entry0 = &mut pt0[idx0];
            if entry0.is_leaf() && entry0.flags().contains(PteFlags::U) {
                let vma = RAM_START + idx1 * MEGA_SIZE + idx0 * PAGE_SIZE;
                f(vma, entry0);
            }
        }
    }
}

/// Deep-copy the active space's user pages into a fresh space.
///
/// Every U leaf of the active space is duplicated frame-by-frame; the
/// copy reads through identity addresses, which are valid in every space
/// because pooled frames are never shadowed by user mappings.
pub fn clone_user_space() -> KernelResult<Mtag> {
    let new = new_user_space()?;
    let mut failed = None;

    let copy_leaf = |vma: usize, pte: &mut Pte| -> KernelResult<()> {
        let frame = frame_allocator::alloc_page()
            .ok_or(KernelError::OutOfMemory { requested: PAGE_SIZE })?;
        // SAFETY: Source and destination frames are pooled,
        // identity-mapped in every space, and distinct.
        unsafe {
            core::ptr::copy_nonoverlapping(pte.addr() as *const u8, frame as *mut u8, PAGE_SIZE);
        }
        // SAFETY: The new space's tables are exclusively owned by this
        // thread until the fork publishes them.
        let dst = match unsafe { walk(new.root(), vma, true) } {
            Ok(dst) => dst,
            Err(e) => {
                frame_allocator::free_page(frame);
                return Err(e);
            }
        };
        // SAFETY: `dst` points into a live level-0 table of the new space.
        unsafe {
            *dst = Pte::leaf(frame, pte.flags());
        }
        Ok(())
    };

    // SAFETY: Only this thread reads the active space's user half;
    // interrupt handlers never touch page tables.
    unsafe {
        for_each_user_leaf(active_root(), |vma, pte| {
            if failed.is_none() {
                if let Err(e) = copy_leaf(vma, pte) {
                    failed = Some(e);
                }
            }
        });
    }

    if let Some(e) = failed {
        reclaim_user_space(new);
        return Err(e);
    }
    Ok(new)
}

/// Install the main space, returning the previously active mtag for
/// reclamation.
pub fn switch_to_main_space() -> Mtag {
    let old = active_mtag();
    install(main_mtag());
    old
}

/// Free every user frame reachable from `old`, then the space's own
/// tables. The root is retained when it is the main root (it holds the
/// kernel's static global mappings).
///
/// `old` must not be the active space.
pub fn reclaim_user_space(old: Mtag) {
    assert!(active_mtag() != old, "reclaiming the active space");

    if old.root() == MAIN_PT2.ptr() {
        // The initial process runs in the main space; only its user
        // leaves are freed, the static tables stay.
        // SAFETY: Serialized by the single-hart execution model.
        unsafe {
            for_each_user_leaf(old.root(), |_vma, pte| {
                frame_allocator::free_page(pte.addr());
                pte.clear();
            });
        }
        sfence();
        return;
    }

    // SAFETY: `old` is no longer installed anywhere; this thread owns its
    // tables outright.
    unsafe {
        for_each_user_leaf(old.root(), |_vma, pte| {
            frame_allocator::free_page(pte.addr());
            pte.clear();
        });

        let root = &mut *old.root();
        let giga_entry = root[vpn(RAM_START, 2)];
        if giga_entry.is_table() {
            let pt1 = &mut *(giga_entry.addr() as *mut PageTable);
            for idx1 in 0..512 {
                let entry1 = pt1[idx1];
                if entry1.is_table() && entry1.addr() != MAIN_PT0.ptr() as usize {
                    frame_allocator::free_page(entry1.addr());
                }
            }
            if giga_entry.addr() != MAIN_PT1.ptr() as usize {
                frame_allocator::free_page(giga_entry.addr());
            }
        }
        frame_allocator::free_page(old.root() as usize);
    }
    sfence();
}

/// Unmap and free every user page of the active space, keeping its
/// tables. Used by `exec` to clear the old image before loading.
pub fn unmap_and_free_user() {
    // SAFETY: Runs on the current thread with exclusive ownership of the
    // active space's user half.
    unsafe {
        for_each_user_leaf(active_root(), |_vma, pte| {
            frame_allocator::free_page(pte.addr());
            pte.clear();
        });
    }
    sfence();
}
