use crate::PteFlags;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{FrameNumber, PhysicalAddress};

/// A single 32-bit x86 paging entry in its raw bitfield form.
///
/// This models the **common superset** of fields found in page directory
/// entries and page table entries. Whether the frame field names a page
/// table, a 4 KiB page or a 4 MiB superpage depends on the level and the
/// `large_page` bit.
///
/// ### Bit layout
///
/// | Bits  | Name / Mnemonic | Meaning |
/// |-------|-----------------|---------|
/// | 0     | `P`             | Valid entry if set |
/// | 1     | `RW`            | Writable if set |
/// | 2     | `US`            | User-mode accessible if set |
/// | 3     | `PWT`           | Write-through caching |
/// | 4     | `PCD`           | Disable caching |
/// | 5     | `A`             | Accessed |
/// | 6     | `D`             | Dirty (leaf only) |
/// | 7     | `PS`            | 4 MiB superpage (directory only) |
/// | 8     | `G`             | Global (leaf only) |
/// | 9–10  | OS avail        | Reserved for OS use |
/// | 11    | COW             | Copy-on-write (OS use) |
/// | 12–31 | `addr`          | Physical frame number |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::FrameNumber;
/// # use kernel_vmem::{PageEntryBits, PteFlags};
/// let e = PageEntryBits::from_parts(FrameNumber::new(0x42), PteFlags::PRESENT | PteFlags::USER);
/// assert!(e.present());
/// assert!(!e.writable());
/// assert_eq!(e.frame(), FrameNumber::new(0x42));
/// assert_eq!(e.into_bits(), 0x0004_2005);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU; not a permission bit.
    pub accessed: bool,

    /// Dirty (D, bit 6) — **leaf only**.
    pub dirty: bool,

    /// Page Size (PS, bit 7).
    ///
    /// In a directory entry, **set** means the entry maps a 4 MiB superpage
    /// and the frame field holds its 4 MiB-aligned base.
    pub large_page: bool,

    /// Global (G, bit 8) — **leaf only**.
    pub global_translation: bool,

    /// OS-available (bits 9..=10).
    #[bits(2)]
    pub os_available: u8,

    /// Copy-on-write marker (bit 11, OS-available to the hardware).
    pub copy_on_write: bool,

    /// Physical frame number (bits 12..=31).
    #[bits(20)]
    frame_bits: u32,
}

impl PageEntryBits {
    /// Build an entry from a frame and permission bits.
    #[inline]
    #[must_use]
    pub const fn from_parts(frame: FrameNumber, flags: PteFlags) -> Self {
        Self::from_bits((frame.as_u32() << 12) | (flags.bits() & 0xFFF))
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> FrameNumber {
        FrameNumber::new(self.frame_bits())
    }

    #[inline]
    pub const fn set_frame(&mut self, frame: FrameNumber) {
        self.set_frame_bits(frame.as_u32());
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        self.frame().base()
    }

    /// The low 12 permission and status bits.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.into_bits() & 0xFFF)
    }

    /// Whether every bit of `required` is set.
    #[inline]
    #[must_use]
    pub const fn grants(&self, required: PteFlags) -> bool {
        self.flags().contains(required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cow_bit_is_bit_eleven() {
        let e = PageEntryBits::new().with_copy_on_write(true);
        assert_eq!(e.into_bits(), 0x800);
        assert_eq!(e.flags(), PteFlags::COPY_ON_WRITE);
    }

    #[test]
    fn parts_roundtrip() {
        let flags = PteFlags::PRESENT | PteFlags::USER | PteFlags::COPY_ON_WRITE;
        let e = PageEntryBits::from_parts(FrameNumber::new(0xFFFFF), flags);
        assert_eq!(e.frame(), FrameNumber::new(0xFFFFF));
        assert_eq!(e.flags(), flags);
        assert!(e.grants(PteFlags::PRESENT | PteFlags::USER));
        assert!(!e.grants(PteFlags::WRITABLE));
    }
}
