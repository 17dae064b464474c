//! Structural view of a PE image.
//!
//! Headers, sections, imports and exports come from `goblin`. The resource
//! tree, the load-config size and the version-info table are read by the
//! bounded walkers below. Corruption inside one of those optional regions
//! marks that region absent instead of failing the whole file.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;

use goblin::pe::header::{Header, SIZEOF_COFF_HEADER, SIZEOF_PE_MAGIC};
use goblin::pe::optional_header::MAGIC_64;
use goblin::pe::section_table::SectionTable;
use goblin::pe::PE;
use tracing::{debug, warn};

use crate::entropy::shannon_entropy;
use crate::error::{Result, ScanError};

const RT_VERSION: u32 = 16;
const RESOURCE_DIR_HEADER: usize = 16;
const RESOURCE_ENTRY_SIZE: usize = 8;
const MAX_RESOURCE_LEAVES: usize = 8192;
const VS_FIXED_SIGNATURE: u32 = 0xFEEF_04BD;
const VS_FIXED_SIZE: usize = 52;

/// `VS_FIXEDFILEINFO` fields counted as version-info keys.
const FIXED_INFO_KEYS: [&str; 7] = [
    "flags",
    "os",
    "type",
    "file_version",
    "product_version",
    "signature",
    "struct_version",
];

/// COFF and optional header fields, widened to `u64`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderFields {
    pub machine: u64,
    pub size_of_optional_header: u64,
    pub characteristics: u64,
    pub major_linker_version: u64,
    pub minor_linker_version: u64,
    pub size_of_code: u64,
    pub size_of_initialized_data: u64,
    pub size_of_uninitialized_data: u64,
    pub address_of_entry_point: u64,
    pub base_of_code: u64,
    pub base_of_data: u64,
    pub image_base: u64,
    pub section_alignment: u64,
    pub file_alignment: u64,
    pub major_operating_system_version: u64,
    pub minor_operating_system_version: u64,
    pub major_image_version: u64,
    pub minor_image_version: u64,
    pub major_subsystem_version: u64,
    pub minor_subsystem_version: u64,
    pub size_of_image: u64,
    pub size_of_headers: u64,
    pub check_sum: u64,
    pub subsystem: u64,
    pub dll_characteristics: u64,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u64,
    pub number_of_rva_and_sizes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectionInfo {
    pub name: String,
    pub raw_size: u64,
    pub virtual_size: u64,
    pub entropy: f64,
}

/// One language leaf of the resource tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInfo {
    pub type_id: Option<u32>,
    pub size: u64,
    pub entropy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub dll_count: usize,
    pub symbol_count: usize,
}

/// Everything the feature extractor needs from one file. Optional regions are
/// `None` when the directory is missing or could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralView {
    pub header: HeaderFields,
    pub sections: Vec<SectionInfo>,
    pub resources: Vec<ResourceInfo>,
    pub imports: Option<ImportSummary>,
    pub export_count: Option<usize>,
    pub load_config_size: Option<u64>,
    pub version_info_keys: Option<usize>,
}

/// Read and decode the file at `path`.
pub fn read_pe(path: &Path) -> Result<StructuralView> {
    let meta = fs::metadata(path).map_err(|_| ScanError::NotAFile { path: path.to_path_buf() })?;
    if !meta.is_file() {
        return Err(ScanError::NotAFile { path: path.to_path_buf() });
    }
    let data = fs::read(path)?;
    parse_pe(path, &data)
}

/// Headers and sections of an image, plus the goblin-decoded import and
/// export summaries when those directories could be read.
struct Image {
    header: Header,
    sections: Vec<SectionTable>,
    imports: Option<ImportSummary>,
    export_count: Option<usize>,
}

impl Image {
    fn from_pe(pe: PE<'_>) -> Self {
        let imports = pe.import_data.as_ref().map(|d| ImportSummary {
            dll_count: d.import_data.len(),
            symbol_count: pe.imports.len(),
        });
        let export_count = pe.export_data.as_ref().map(|_| pe.exports.len());
        Self {
            header: pe.header,
            sections: pe.sections,
            imports,
            export_count,
        }
    }

    /// Headers and section table only, for images whose import or export
    /// directory goblin refuses to map.
    fn headers_only(data: &[u8]) -> goblin::error::Result<Self> {
        let header = Header::parse(data)?;
        let mut offset = header.dos_header.pe_pointer as usize
            + SIZEOF_PE_MAGIC
            + SIZEOF_COFF_HEADER
            + header.coff_header.size_of_optional_header as usize;
        let sections = header.coff_header.sections(data, &mut offset)?;
        Ok(Self {
            header,
            sections,
            imports: None,
            export_count: None,
        })
    }
}

/// Decode an in-memory image. `path` is only used for error messages.
pub fn parse_pe(path: &Path, data: &[u8]) -> Result<StructuralView> {
    let image = match PE::parse(data) {
        Ok(pe) => Image::from_pe(pe),
        Err(e) => {
            let image = Image::headers_only(data).map_err(|_| ScanError::malformed(path, e.to_string()))?;
            warn!(
                path = %path.display(),
                error = %e,
                "import/export directories are malformed, treating as absent"
            );
            image
        }
    };
    let Some(optional) = image.header.optional_header.as_ref() else {
        return Err(ScanError::malformed(path, "missing optional header"));
    };
    if image.sections.is_empty() {
        return Err(ScanError::malformed(path, "image has no sections"));
    }
    let is_64 = optional.standard_fields.magic == MAGIC_64;

    let coff = &image.header.coff_header;
    let standard = &optional.standard_fields;
    let windows = &optional.windows_fields;
    let header = HeaderFields {
        machine: coff.machine as u64,
        size_of_optional_header: coff.size_of_optional_header as u64,
        characteristics: coff.characteristics as u64,
        major_linker_version: standard.major_linker_version as u64,
        minor_linker_version: standard.minor_linker_version as u64,
        size_of_code: standard.size_of_code as u64,
        size_of_initialized_data: standard.size_of_initialized_data as u64,
        size_of_uninitialized_data: standard.size_of_uninitialized_data as u64,
        address_of_entry_point: standard.address_of_entry_point as u64,
        base_of_code: standard.base_of_code as u64,
        // PE32+ has no BaseOfData field.
        base_of_data: if is_64 { 0 } else { standard.base_of_data as u64 },
        image_base: windows.image_base as u64,
        section_alignment: windows.section_alignment as u64,
        file_alignment: windows.file_alignment as u64,
        major_operating_system_version: windows.major_operating_system_version as u64,
        minor_operating_system_version: windows.minor_operating_system_version as u64,
        major_image_version: windows.major_image_version as u64,
        minor_image_version: windows.minor_image_version as u64,
        major_subsystem_version: windows.major_subsystem_version as u64,
        minor_subsystem_version: windows.minor_subsystem_version as u64,
        size_of_image: windows.size_of_image as u64,
        size_of_headers: windows.size_of_headers as u64,
        check_sum: windows.check_sum as u64,
        subsystem: windows.subsystem as u64,
        dll_characteristics: windows.dll_characteristics as u64,
        size_of_stack_reserve: windows.size_of_stack_reserve as u64,
        size_of_stack_commit: windows.size_of_stack_commit as u64,
        size_of_heap_reserve: windows.size_of_heap_reserve as u64,
        size_of_heap_commit: windows.size_of_heap_commit as u64,
        loader_flags: windows.loader_flags as u64,
        number_of_rva_and_sizes: windows.number_of_rva_and_sizes as u64,
    };

    let sections = image
        .sections
        .iter()
        .map(|s| SectionInfo {
            name: String::from_utf8_lossy(&s.name).trim_end_matches('\0').to_string(),
            raw_size: s.size_of_raw_data as u64,
            virtual_size: s.virtual_size as u64,
            entropy: shannon_entropy(section_bytes(s, data)),
        })
        .collect();

    let mapper = RvaMapper {
        sections: &image.sections,
        size_of_headers: windows.size_of_headers,
        data,
    };

    let (resources, version_info_keys) = match optional.data_directories.get_resource_table() {
        Some(dir) => match walk_resources(&mapper, dir.virtual_address, dir.size) {
            Some(leaves) => {
                let version = version_key_count(&mapper, &leaves);
                let resources = leaves
                    .into_iter()
                    .map(|leaf| ResourceInfo {
                        type_id: leaf.type_id,
                        size: leaf.size as u64,
                        entropy: shannon_entropy(mapper.slice(leaf.data_rva, leaf.size).unwrap_or(&[])),
                    })
                    .collect();
                (resources, version)
            }
            None => {
                warn!(path = %path.display(), "resource directory is malformed, treating as absent");
                (Vec::new(), None)
            }
        },
        None => (Vec::new(), None),
    };

    let load_config_size = optional
        .data_directories
        .get_load_config_table()
        .as_ref()
        .and_then(|dir| {
            let size = mapper.read_u32(dir.virtual_address);
            if size.is_none() {
                warn!(path = %path.display(), "load config directory is unreadable, treating as absent");
            }
            size.map(u64::from)
        });

    debug!(
        path = %path.display(),
        sections = image.sections.len(),
        resources = resources.len(),
        "decoded PE structure"
    );

    Ok(StructuralView {
        header,
        sections,
        resources,
        imports: image.imports,
        export_count: image.export_count,
        load_config_size,
        version_info_keys,
    })
}

fn section_bytes<'a>(section: &SectionTable, data: &'a [u8]) -> &'a [u8] {
    let start = section.pointer_to_raw_data as usize;
    if start >= data.len() {
        return &[];
    }
    let end = start.saturating_add(section.size_of_raw_data as usize).min(data.len());
    &data[start..end]
}

/// Translates relative virtual addresses to file offsets through the section table.
struct RvaMapper<'a> {
    sections: &'a [SectionTable],
    size_of_headers: u32,
    data: &'a [u8],
}

impl<'a> RvaMapper<'a> {
    fn offset(&self, rva: u32) -> Option<usize> {
        if rva < self.size_of_headers {
            return ((rva as usize) < self.data.len()).then_some(rva as usize);
        }
        for s in self.sections {
            let span = s.virtual_size.max(s.size_of_raw_data);
            if rva >= s.virtual_address && rva - s.virtual_address < span {
                let delta = (rva - s.virtual_address) as usize;
                if delta >= s.size_of_raw_data as usize {
                    return None;
                }
                let offset = (s.pointer_to_raw_data as usize).checked_add(delta)?;
                return (offset < self.data.len()).then_some(offset);
            }
        }
        None
    }

    /// Bytes at `rva`, clipped to the end of the file.
    fn slice(&self, rva: u32, len: u32) -> Option<&'a [u8]> {
        let start = self.offset(rva)?;
        let end = start.saturating_add(len as usize).min(self.data.len());
        Some(&self.data[start..end])
    }

    fn read_u32(&self, rva: u32) -> Option<u32> {
        read_u32(self.data, self.offset(rva)?)
    }
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[derive(Debug, Clone, Copy)]
struct ResourceLeaf {
    type_id: Option<u32>,
    data_rva: u32,
    size: u32,
}

#[derive(Debug, Clone, Copy)]
struct ResourceEntry {
    id: Option<u32>,
    target: u32,
    is_directory: bool,
}

/// Walk the type -> id -> language tree. Returns `None` on any structural
/// inconsistency so the caller can drop the whole region.
fn walk_resources(mapper: &RvaMapper<'_>, rva: u32, size: u32) -> Option<Vec<ResourceLeaf>> {
    let base = mapper.offset(rva)?;
    let end = base.saturating_add(size as usize).min(mapper.data.len());
    let region = &mapper.data[base..end];
    let mut visited = HashSet::new();
    let mut leaves = Vec::new();

    for type_entry in directory_entries(region, 0, &mut visited)? {
        if !type_entry.is_directory {
            continue;
        }
        for id_entry in directory_entries(region, type_entry.target as usize, &mut visited)? {
            if !id_entry.is_directory {
                continue;
            }
            for lang_entry in directory_entries(region, id_entry.target as usize, &mut visited)? {
                if lang_entry.is_directory {
                    continue;
                }
                let at = lang_entry.target as usize;
                let data_rva = read_u32(region, at)?;
                let size = read_u32(region, at + 4)?;
                mapper.offset(data_rva)?;
                leaves.push(ResourceLeaf {
                    type_id: type_entry.id,
                    data_rva,
                    size,
                });
                if leaves.len() > MAX_RESOURCE_LEAVES {
                    return None;
                }
            }
        }
    }
    Some(leaves)
}

fn directory_entries(
    region: &[u8],
    offset: usize,
    visited: &mut HashSet<usize>,
) -> Option<Vec<ResourceEntry>> {
    if !visited.insert(offset) {
        return None;
    }
    let named = read_u16(region, offset + 12)? as usize;
    let ids = read_u16(region, offset + 14)? as usize;
    let count = named + ids;
    let first = offset + RESOURCE_DIR_HEADER;
    if first + count * RESOURCE_ENTRY_SIZE > region.len() {
        return None;
    }

    (0..count)
        .map(|i| {
            let at = first + i * RESOURCE_ENTRY_SIZE;
            let name = read_u32(region, at)?;
            let target = read_u32(region, at + 4)?;
            Some(ResourceEntry {
                id: (name & 0x8000_0000 == 0).then_some(name),
                target: target & 0x7FFF_FFFF,
                is_directory: target & 0x8000_0000 != 0,
            })
        })
        .collect()
}

fn version_key_count(mapper: &RvaMapper<'_>, leaves: &[ResourceLeaf]) -> Option<usize> {
    let leaf = leaves.iter().find(|l| l.type_id == Some(RT_VERSION))?;
    let blob = mapper.slice(leaf.data_rva, leaf.size)?;
    count_version_keys(blob)
}

/// One node of a `VS_VERSIONINFO` tree.
struct VersionBlock<'a> {
    key: String,
    value: &'a [u8],
    children: &'a [u8],
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Parse the block at the start of `buf`; returns it and the length it spans.
fn parse_version_block(buf: &[u8]) -> Option<(VersionBlock<'_>, usize)> {
    let length = read_u16(buf, 0)? as usize;
    let value_len = read_u16(buf, 2)? as usize;
    let kind = read_u16(buf, 4)?;
    if length < 6 || length > buf.len() {
        return None;
    }
    let block = &buf[..length];

    let mut units = Vec::new();
    let mut at = 6;
    loop {
        let unit = read_u16(block, at)?;
        at += 2;
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    let key = String::from_utf16_lossy(&units);

    let value_start = align4(at).min(length);
    let value_bytes = if kind == 1 { value_len * 2 } else { value_len };
    let value_end = value_start.saturating_add(value_bytes).min(length);
    let children_start = align4(value_end).min(length);

    Some((
        VersionBlock {
            key,
            value: &block[value_start..value_end],
            children: &block[children_start..],
        },
        length,
    ))
}

fn child_blocks(mut buf: &[u8]) -> Option<Vec<VersionBlock<'_>>> {
    let mut blocks = Vec::new();
    while buf.len() >= 6 {
        if read_u16(buf, 0)? == 0 {
            break;
        }
        let (block, length) = parse_version_block(buf)?;
        blocks.push(block);
        buf = &buf[align4(length).min(buf.len())..];
    }
    Some(blocks)
}

/// Number of distinct keys in the version resource, including the fixed-info fields.
fn count_version_keys(blob: &[u8]) -> Option<usize> {
    let (root, _) = parse_version_block(blob)?;
    if root.key != "VS_VERSION_INFO" {
        return None;
    }

    let mut keys = BTreeSet::new();
    for child in child_blocks(root.children)? {
        match child.key.as_str() {
            "StringFileInfo" => {
                for table in child_blocks(child.children)? {
                    for entry in child_blocks(table.children)? {
                        keys.insert(entry.key);
                    }
                }
            }
            "VarFileInfo" => {
                for var in child_blocks(child.children)? {
                    keys.insert(var.key);
                }
            }
            _ => {}
        }
    }

    let has_fixed = root.value.len() >= VS_FIXED_SIZE && read_u32(root.value, 0) == Some(VS_FIXED_SIGNATURE);
    if has_fixed {
        keys.extend(FIXED_INFO_KEYS.iter().map(|k| k.to_string()));
    }
    Some(keys.len())
}
