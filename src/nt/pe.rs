//! Introspection of *mapped* PE images.
//!
//! goblin's full `PE::parse` expects file layout (section raw offsets); the
//! images the runtime looks at are already mapped by the loader, where an
//! RVA is a plain offset from the base. So we use goblin for the header and
//! section table and walk the export/import directories by RVA ourselves.
//! This is also the only form bootstrap can afford: it runs before imports
//! exist, and everything here is statically linked and touches only the
//! given byte slices.

use goblin::pe::header::Header;
use goblin::pe::section_table::SectionTable;

const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;

fn read_u16(image: &[u8], off: usize) -> Option<u16> {
    let b = image.get(off..off + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(image: &[u8], off: usize) -> Option<u32> {
    let b = image.get(off..off + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(image: &[u8], off: usize) -> Option<u64> {
    let b = image.get(off..off + 8)?;
    let mut a = [0u8; 8];
    a.copy_from_slice(b);
    Some(u64::from_le_bytes(a))
}

fn read_c_str(image: &[u8], off: usize) -> Option<&str> {
    let tail = image.get(off..)?;
    let len = memchr::memchr(0, tail)?;
    std::str::from_utf8(&tail[..len]).ok()
}

/// Parsed header plus section table of a mapped image.
pub struct MappedPe<'a> {
    image: &'a [u8],
    header: Header,
    sections: Vec<SectionTable>,
}

impl<'a> MappedPe<'a> {
    pub fn parse(image: &'a [u8]) -> Option<MappedPe<'a>> {
        let header = Header::parse(image).ok()?;
        let mut offset = header.dos_header.pe_pointer as usize
            + 4 // PE\0\0
            + goblin::pe::header::SIZEOF_COFF_HEADER
            + header.coff_header.size_of_optional_header as usize;
        let sections = header
            .coff_header
            .sections(image, &mut offset)
            .unwrap_or_default();
        Some(MappedPe {
            image,
            header,
            sections,
        })
    }

    pub fn is_64bit(&self) -> bool {
        self.header
            .optional_header
            .as_ref()
            .map(|oh| oh.standard_fields.magic == goblin::pe::optional_header::MAGIC_64)
            .unwrap_or(false)
    }

    pub fn size_of_image(&self) -> usize {
        self.header
            .optional_header
            .as_ref()
            .map(|oh| oh.windows_fields.size_of_image as usize)
            .unwrap_or(self.image.len())
    }

    fn data_directory(&self, index: usize) -> Option<(u32, u32)> {
        let oh = self.header.optional_header.as_ref()?;
        let dd = *oh.data_directories.data_directories.get(index)?;
        let dd = dd?;
        if dd.virtual_address == 0 || dd.size == 0 {
            return None;
        }
        Some((dd.virtual_address, dd.size))
    }

    /// RVA of the named export's entry point, by linear walk of the export
    /// name table. Forwarded exports (RVA pointing back into the export
    /// directory) are reported as absent: the runtime never wants a
    /// forwarder.
    pub fn export_rva(&self, name: &str) -> Option<u32> {
        let (dir_rva, dir_size) = self.data_directory(0)?;
        let dir = dir_rva as usize;
        let functions_rva = read_u32(self.image, dir + 0x1C)? as usize;
        let names_rva = read_u32(self.image, dir + 0x20)? as usize;
        let ordinals_rva = read_u32(self.image, dir + 0x24)? as usize;
        let number_of_names = read_u32(self.image, dir + 0x18)? as usize;

        for i in 0..number_of_names {
            let name_rva = read_u32(self.image, names_rva + 4 * i)? as usize;
            match read_c_str(self.image, name_rva) {
                Some(n) if n == name => {
                    let ordinal = read_u16(self.image, ordinals_rva + 2 * i)? as usize;
                    let rva = read_u32(self.image, functions_rva + 4 * ordinal)?;
                    // Forwarder: target lies inside the export directory.
                    if rva >= dir_rva && rva < dir_rva + dir_size {
                        return None;
                    }
                    return Some(rva);
                }
                _ => continue,
            }
        }
        None
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.export_rva(name).is_some()
    }

    /// Imports declared against `dll` (case-insensitive), as
    /// `(iat_entry_rva, symbol_name)` pairs. Ordinal-only imports are
    /// skipped; the runtime imports everything by name.
    pub fn imports_from(&self, dll: &str) -> Vec<(u32, String)> {
        let mut out = Vec::new();
        let (dir_rva, _size) = match self.data_directory(1) {
            Some(d) => d,
            None => return out,
        };
        let thunk_width = if self.is_64bit() { 8 } else { 4 };
        let mut desc = dir_rva as usize;
        loop {
            let original_first_thunk = match read_u32(self.image, desc) {
                Some(v) => v as usize,
                None => break,
            };
            let name_rva = match read_u32(self.image, desc + 0x0C) {
                Some(v) => v as usize,
                None => break,
            };
            let first_thunk = match read_u32(self.image, desc + 0x10) {
                Some(v) => v as usize,
                None => break,
            };
            if name_rva == 0 && first_thunk == 0 {
                break;
            }
            let dll_name = read_c_str(self.image, name_rva).unwrap_or("");
            if dll_name.eq_ignore_ascii_case(dll) {
                // Prefer the unbound name table; fall back to the IAT when
                // the linker omitted it.
                let names = if original_first_thunk != 0 {
                    original_first_thunk
                } else {
                    first_thunk
                };
                let mut i = 0;
                loop {
                    let thunk = if thunk_width == 8 {
                        match read_u64(self.image, names + 8 * i) {
                            Some(v) => v,
                            None => break,
                        }
                    } else {
                        match read_u32(self.image, names + 4 * i) {
                            Some(v) => v as u64,
                            None => break,
                        }
                    };
                    if thunk == 0 {
                        break;
                    }
                    let by_ordinal = if thunk_width == 8 {
                        thunk & (1 << 63) != 0
                    } else {
                        thunk & (1 << 31) != 0
                    };
                    if !by_ordinal {
                        // +2 skips the hint word.
                        if let Some(sym) = read_c_str(self.image, thunk as usize + 2) {
                            out.push((
                                (first_thunk + thunk_width * i) as u32,
                                sym.to_string(),
                            ));
                        }
                    }
                    i += 1;
                }
            }
            desc += 0x14; // sizeof IMAGE_IMPORT_DESCRIPTOR
        }
        out
    }

    /// The trailing in-page padding of the last executable section:
    /// `[used_end, page_end)` as RVAs, or None when the section ends exactly
    /// on a page boundary.
    pub fn executable_tail_padding(&self) -> Option<(u32, u32)> {
        let sec = self
            .sections
            .iter()
            .filter(|s| s.characteristics & IMAGE_SCN_MEM_EXECUTE != 0)
            .last()?;
        let used_end = sec.virtual_address + sec.virtual_size;
        let page_end = super::types::page_align_up(used_end as usize) as u32;
        if page_end > used_end {
            Some((used_end, page_end))
        } else {
            None
        }
    }
}
