//! Minimal PE32 image builder for tests.

const FILE_ALIGNMENT: usize = 0x200;
const SECTION_ALIGNMENT: usize = 0x1000;
const HEADERS_SIZE: usize = 0x400;
const PE_OFFSET: usize = 0x80;
const OPTIONAL_HEADER_SIZE: usize = 0xE0;

fn align(n: usize, to: usize) -> usize {
    n.div_ceil(to) * to
}

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

#[derive(Default)]
pub struct PeBuilder {
    sections: Vec<(String, Vec<u8>)>,
    resources: Vec<(u32, Vec<u8>)>,
    load_config: Option<u32>,
    corrupt_resources: bool,
    raw_directories: Vec<(usize, u32, u32)>,
}

impl PeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(mut self, name: &str, data: Vec<u8>) -> Self {
        self.sections.push((name.to_string(), data));
        self
    }

    /// Add a resource leaf under `type_id`, with id 1 and language 0x409.
    pub fn resource(mut self, type_id: u32, data: Vec<u8>) -> Self {
        self.resources.push((type_id, data));
        self
    }

    pub fn load_config(mut self, size: u32) -> Self {
        self.load_config = Some(size);
        self
    }

    /// Point data directory `index` at `rva` without laying out any content there.
    pub fn data_directory(mut self, index: usize, rva: u32, size: u32) -> Self {
        self.raw_directories.push((index, rva, size));
        self
    }

    /// Claim far more root entries than the directory holds.
    pub fn corrupt_resources(mut self) -> Self {
        self.corrupt_resources = true;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut sections = self.sections.clone();
        let mut resource_dir = None;
        let mut load_config_dir = None;

        let next_va = |count: usize| SECTION_ALIGNMENT * (count + 1);

        if !self.resources.is_empty() {
            let va = next_va(sections.len());
            let mut rsrc = resource_section(&self.resources, va as u32);
            if self.corrupt_resources {
                put_u16(&mut rsrc, 14, 0xFFFF);
            }
            resource_dir = Some((va as u32, rsrc.len() as u32));
            sections.push((".rsrc".to_string(), rsrc));
        }
        if let Some(size) = self.load_config {
            let va = next_va(sections.len());
            let mut blob = vec![0u8; (size as usize).max(4)];
            put_u32(&mut blob, 0, size);
            load_config_dir = Some((va as u32, size));
            sections.push((".rdata".to_string(), blob));
        }

        let mut image = vec![0u8; HEADERS_SIZE];
        image[0] = b'M';
        image[1] = b'Z';
        put_u32(&mut image, 0x3C, PE_OFFSET as u32);
        image[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let coff = PE_OFFSET + 4;
        put_u16(&mut image, coff, 0x14c);
        put_u16(&mut image, coff + 2, sections.len() as u16);
        put_u16(&mut image, coff + 16, OPTIONAL_HEADER_SIZE as u16);
        put_u16(&mut image, coff + 18, 0x0102);

        let mut raw_ptr = HEADERS_SIZE;
        let mut table = Vec::new();
        for (i, (_, data)) in sections.iter().enumerate() {
            let raw_size = align(data.len().max(1), FILE_ALIGNMENT);
            table.push((next_va(i), data.len(), raw_ptr, raw_size));
            raw_ptr += raw_size;
        }
        let size_of_image = table
            .last()
            .map(|&(va, vsize, _, _)| align(va + vsize.max(1), SECTION_ALIGNMENT))
            .unwrap_or(SECTION_ALIGNMENT);

        let opt = coff + 20;
        put_u16(&mut image, opt, 0x10b);
        image[opt + 2] = 14;
        image[opt + 3] = 0;
        put_u32(&mut image, opt + 4, table.first().map(|t| t.3 as u32).unwrap_or(0));
        put_u32(&mut image, opt + 16, SECTION_ALIGNMENT as u32);
        put_u32(&mut image, opt + 20, SECTION_ALIGNMENT as u32);
        put_u32(&mut image, opt + 24, 2 * SECTION_ALIGNMENT as u32);
        put_u32(&mut image, opt + 28, 0x40_0000);
        put_u32(&mut image, opt + 32, SECTION_ALIGNMENT as u32);
        put_u32(&mut image, opt + 36, FILE_ALIGNMENT as u32);
        put_u16(&mut image, opt + 40, 6);
        put_u16(&mut image, opt + 48, 6);
        put_u32(&mut image, opt + 56, size_of_image as u32);
        put_u32(&mut image, opt + 60, HEADERS_SIZE as u32);
        put_u16(&mut image, opt + 68, 2);
        put_u16(&mut image, opt + 70, 0x8140);
        put_u32(&mut image, opt + 72, 0x10_0000);
        put_u32(&mut image, opt + 76, 0x1000);
        put_u32(&mut image, opt + 80, 0x10_0000);
        put_u32(&mut image, opt + 84, 0x1000);
        put_u32(&mut image, opt + 92, 16);

        let dirs = opt + 96;
        if let Some((va, size)) = resource_dir {
            put_u32(&mut image, dirs + 2 * 8, va);
            put_u32(&mut image, dirs + 2 * 8 + 4, size);
        }
        if let Some((va, size)) = load_config_dir {
            put_u32(&mut image, dirs + 10 * 8, va);
            put_u32(&mut image, dirs + 10 * 8 + 4, size);
        }
        for &(index, va, size) in &self.raw_directories {
            put_u32(&mut image, dirs + index * 8, va);
            put_u32(&mut image, dirs + index * 8 + 4, size);
        }

        let headers = opt + OPTIONAL_HEADER_SIZE;
        for (i, ((name, _), &(va, vsize, ptr, raw))) in sections.iter().zip(&table).enumerate() {
            let at = headers + i * 40;
            let name_bytes = name.as_bytes();
            let n = name_bytes.len().min(8);
            image[at..at + n].copy_from_slice(&name_bytes[..n]);
            put_u32(&mut image, at + 8, vsize as u32);
            put_u32(&mut image, at + 12, va as u32);
            put_u32(&mut image, at + 16, raw as u32);
            put_u32(&mut image, at + 20, ptr as u32);
            put_u32(&mut image, at + 36, 0x4000_0040);
        }

        for ((_, data), &(_, _, ptr, raw)) in sections.iter().zip(&table) {
            image.resize(ptr, 0);
            image.extend_from_slice(data);
            image.resize(ptr + raw, 0);
        }
        image
    }
}

/// Lay out a three-level resource tree followed by its data blobs.
fn resource_section(resources: &[(u32, Vec<u8>)], section_va: u32) -> Vec<u8> {
    let n = resources.len();
    let root = 16 + 8 * n;
    let type_dirs = root;
    let id_dirs = type_dirs + 24 * n;
    let data_entries = id_dirs + 24 * n;
    let mut blob_at = align(data_entries + 16 * n, 4);

    let mut out = vec![0u8; blob_at];
    put_u16(&mut out, 14, n as u16);
    for (i, (type_id, data)) in resources.iter().enumerate() {
        let type_dir = type_dirs + 24 * i;
        let id_dir = id_dirs + 24 * i;
        let entry = data_entries + 16 * i;

        put_u32(&mut out, 16 + 8 * i, *type_id);
        put_u32(&mut out, 16 + 8 * i + 4, 0x8000_0000 | type_dir as u32);

        put_u16(&mut out, type_dir + 14, 1);
        put_u32(&mut out, type_dir + 16, 1);
        put_u32(&mut out, type_dir + 20, 0x8000_0000 | id_dir as u32);

        put_u16(&mut out, id_dir + 14, 1);
        put_u32(&mut out, id_dir + 16, 0x409);
        put_u32(&mut out, id_dir + 20, entry as u32);

        put_u32(&mut out, entry, section_va + blob_at as u32);
        put_u32(&mut out, entry + 4, data.len() as u32);

        out.extend_from_slice(data);
        pad4(&mut out);
        blob_at = out.len();
    }
    out
}

fn utf16z(s: &str) -> Vec<u8> {
    s.encode_utf16().chain(std::iter::once(0)).flat_map(u16::to_le_bytes).collect()
}

fn version_block(key: &str, value: &[u8], value_len: u16, kind: u16, children: &[Vec<u8>]) -> Vec<u8> {
    let mut out = vec![0u8; 6];
    out.extend(utf16z(key));
    pad4(&mut out);
    out.extend_from_slice(value);
    for child in children {
        pad4(&mut out);
        out.extend_from_slice(child);
    }
    let length = out.len() as u16;
    put_u16(&mut out, 0, length);
    put_u16(&mut out, 2, value_len);
    put_u16(&mut out, 4, kind);
    out
}

/// A `VS_VERSIONINFO` resource with fixed info, the given string keys and one `Translation` var.
pub fn version_info_blob(keys: &[&str]) -> Vec<u8> {
    let strings: Vec<Vec<u8>> = keys
        .iter()
        .map(|k| {
            let value = utf16z("x");
            version_block(k, &value, (value.len() / 2) as u16, 1, &[])
        })
        .collect();
    let table = version_block("040904B0", &[], 0, 1, &strings);
    let string_info = version_block("StringFileInfo", &[], 0, 1, &[table]);
    let var = version_block("Translation", &[0x09, 0x04, 0xB0, 0x04], 4, 0, &[]);
    let var_info = version_block("VarFileInfo", &[], 0, 1, &[var]);

    let mut fixed = vec![0u8; 52];
    put_u32(&mut fixed, 0, 0xFEEF_04BD);
    put_u32(&mut fixed, 4, 0x0001_0000);
    version_block("VS_VERSION_INFO", &fixed, 52, 0, &[string_info, var_info])
}
