//! Feature extraction - turns a decoded PE structure into the named numeric
//! vector the classifier was trained on.
//!
//! The feature names are the column names of the training corpus and must not
//! change without bumping [`FEATURE_SCHEMA_VERSION`].

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, ScanError};
use crate::pe::{read_pe, StructuralView};

/// Bumped whenever a feature is added, removed, renamed or its derivation changes.
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

macro_rules! feature_ids {
    ($($variant:ident => $name:literal,)+) => {
        /// Closed set of features produced by [`extract`], in extraction order.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum FeatureId {
            $($variant,)+
        }

        impl FeatureId {
            pub const ALL: &'static [FeatureId] = &[$(FeatureId::$variant,)+];
            pub const COUNT: usize = Self::ALL.len();

            /// Column name used by the training corpus.
            pub fn name(self) -> &'static str {
                match self {
                    $(FeatureId::$variant => $name,)+
                }
            }
        }

        impl FromStr for FeatureId {
            type Err = ScanError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok(FeatureId::$variant),)+
                    _ => Err(ScanError::FeatureMismatch { name: s.to_string() }),
                }
            }
        }
    };
}

feature_ids! {
    Machine => "Machine",
    SizeOfOptionalHeader => "SizeOfOptionalHeader",
    Characteristics => "Characteristics",
    MajorLinkerVersion => "MajorLinkerVersion",
    MinorLinkerVersion => "MinorLinkerVersion",
    SizeOfCode => "SizeOfCode",
    SizeOfInitializedData => "SizeOfInitializedData",
    SizeOfUninitializedData => "SizeOfUninitializedData",
    AddressOfEntryPoint => "AddressOfEntryPoint",
    BaseOfCode => "BaseOfCode",
    BaseOfData => "BaseOfData",
    ImageBase => "ImageBase",
    SectionAlignment => "SectionAlignment",
    FileAlignment => "FileAlignment",
    MajorOperatingSystemVersion => "MajorOperatingSystemVersion",
    MinorOperatingSystemVersion => "MinorOperatingSystemVersion",
    MajorImageVersion => "MajorImageVersion",
    MinorImageVersion => "MinorImageVersion",
    MajorSubsystemVersion => "MajorSubsystemVersion",
    MinorSubsystemVersion => "MinorSubsystemVersion",
    SizeOfImage => "SizeOfImage",
    SizeOfHeaders => "SizeOfHeaders",
    CheckSum => "CheckSum",
    Subsystem => "Subsystem",
    DllCharacteristics => "DllCharacteristics",
    SizeOfStackReserve => "SizeOfStackReserve",
    SizeOfStackCommit => "SizeOfStackCommit",
    SizeOfHeapReserve => "SizeOfHeapReserve",
    SizeOfHeapCommit => "SizeOfHeapCommit",
    LoaderFlags => "LoaderFlags",
    NumberOfRvaAndSizes => "NumberOfRvaAndSizes",
    SectionsNb => "SectionsNb",
    SectionsMeanEntropy => "SectionsMeanEntropy",
    SectionsMinEntropy => "SectionsMinEntropy",
    SectionsMaxEntropy => "SectionsMaxEntropy",
    SectionsMeanRawsize => "SectionsMeanRawsize",
    SectionsMinRawsize => "SectionsMinRawsize",
    SectionsMaxRawsize => "SectionsMaxRawsize",
    SectionsMeanVirtualsize => "SectionsMeanVirtualsize",
    SectionsMinVirtualsize => "SectionsMinVirtualsize",
    SectionMaxVirtualsize => "SectionMaxVirtualsize",
    ImportsNbDLL => "ImportsNbDLL",
    ImportsNb => "ImportsNb",
    ImportsNbOrdinal => "ImportsNbOrdinal",
    ExportNb => "ExportNb",
    ResourcesNb => "ResourcesNb",
    ResourcesMeanEntropy => "ResourcesMeanEntropy",
    ResourcesMinEntropy => "ResourcesMinEntropy",
    ResourcesMaxEntropy => "ResourcesMaxEntropy",
    ResourcesMeanSize => "ResourcesMeanSize",
    ResourcesMinSize => "ResourcesMinSize",
    ResourcesMaxSize => "ResourcesMaxSize",
    LoadConfigurationSize => "LoadConfigurationSize",
    VersionInformationSize => "VersionInformationSize",
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value for every [`FeatureId`]; no field is ever missing.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: [f64; FeatureId::COUNT],
}

impl FeatureVector {
    fn zeroed() -> Self {
        Self { values: [0.0; FeatureId::COUNT] }
    }

    fn set(&mut self, id: FeatureId, value: f64) {
        self.values[id as usize] = value;
    }

    pub fn get(&self, id: FeatureId) -> f64 {
        self.values[id as usize]
    }

    /// Look a feature up by its corpus column name.
    pub fn lookup(&self, name: &str) -> Option<f64> {
        name.parse::<FeatureId>().ok().map(|id| self.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeatureId, f64)> + '_ {
        FeatureId::ALL.iter().map(move |&id| (id, self.get(id)))
    }

    /// Values for `names`, in that order. Fails on the first name this
    /// extractor does not produce; nothing is ever zero-filled.
    pub fn project<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<f64>> {
        names
            .iter()
            .map(|name| {
                let id: FeatureId = name.as_ref().parse()?;
                Ok(self.get(id))
            })
            .collect()
    }
}

/// Count / mean / min / max of a collection; all zero when it is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Aggregate {
    count: f64,
    mean: f64,
    min: f64,
    max: f64,
}

fn aggregate(values: impl Iterator<Item = f64>) -> Aggregate {
    let mut count = 0usize;
    let mut sum = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in values {
        count += 1;
        sum += v;
        min = min.min(v);
        max = max.max(v);
    }
    if count == 0 {
        return Aggregate::default();
    }
    Aggregate {
        count: count as f64,
        mean: sum / count as f64,
        min,
        max,
    }
}

/// Build the feature vector for one decoded file. The view is expected to
/// hold at least one section; [`read_pe`] rejects images without any.
pub fn extract(view: &StructuralView) -> FeatureVector {
    use FeatureId::*;

    let mut fv = FeatureVector::zeroed();
    let h = &view.header;
    let header = [
        (Machine, h.machine),
        (SizeOfOptionalHeader, h.size_of_optional_header),
        (Characteristics, h.characteristics),
        (MajorLinkerVersion, h.major_linker_version),
        (MinorLinkerVersion, h.minor_linker_version),
        (SizeOfCode, h.size_of_code),
        (SizeOfInitializedData, h.size_of_initialized_data),
        (SizeOfUninitializedData, h.size_of_uninitialized_data),
        (AddressOfEntryPoint, h.address_of_entry_point),
        (BaseOfCode, h.base_of_code),
        (BaseOfData, h.base_of_data),
        (ImageBase, h.image_base),
        (SectionAlignment, h.section_alignment),
        (FileAlignment, h.file_alignment),
        (MajorOperatingSystemVersion, h.major_operating_system_version),
        (MinorOperatingSystemVersion, h.minor_operating_system_version),
        (MajorImageVersion, h.major_image_version),
        (MinorImageVersion, h.minor_image_version),
        (MajorSubsystemVersion, h.major_subsystem_version),
        (MinorSubsystemVersion, h.minor_subsystem_version),
        (SizeOfImage, h.size_of_image),
        (SizeOfHeaders, h.size_of_headers),
        (CheckSum, h.check_sum),
        (Subsystem, h.subsystem),
        (DllCharacteristics, h.dll_characteristics),
        (SizeOfStackReserve, h.size_of_stack_reserve),
        (SizeOfStackCommit, h.size_of_stack_commit),
        (SizeOfHeapReserve, h.size_of_heap_reserve),
        (SizeOfHeapCommit, h.size_of_heap_commit),
        (LoaderFlags, h.loader_flags),
        (NumberOfRvaAndSizes, h.number_of_rva_and_sizes),
    ];
    for (id, value) in header {
        fv.set(id, value as f64);
    }

    let entropy = aggregate(view.sections.iter().map(|s| s.entropy));
    let raw = aggregate(view.sections.iter().map(|s| s.raw_size as f64));
    let virt = aggregate(view.sections.iter().map(|s| s.virtual_size as f64));
    fv.set(SectionsNb, entropy.count);
    fv.set(SectionsMeanEntropy, entropy.mean);
    fv.set(SectionsMinEntropy, entropy.min);
    fv.set(SectionsMaxEntropy, entropy.max);
    fv.set(SectionsMeanRawsize, raw.mean);
    fv.set(SectionsMinRawsize, raw.min);
    fv.set(SectionsMaxRawsize, raw.max);
    fv.set(SectionsMeanVirtualsize, virt.mean);
    fv.set(SectionsMinVirtualsize, virt.min);
    fv.set(SectionMaxVirtualsize, virt.max);

    let (dlls, symbols) = view
        .imports
        .map(|i| (i.dll_count, i.symbol_count))
        .unwrap_or((0, 0));
    fv.set(ImportsNbDLL, dlls as f64);
    fv.set(ImportsNb, symbols as f64);
    fv.set(ImportsNbOrdinal, 0.0);
    fv.set(ExportNb, view.export_count.unwrap_or(0) as f64);

    let entropy = aggregate(view.resources.iter().map(|r| r.entropy));
    let size = aggregate(view.resources.iter().map(|r| r.size as f64));
    fv.set(ResourcesNb, entropy.count);
    fv.set(ResourcesMeanEntropy, entropy.mean);
    fv.set(ResourcesMinEntropy, entropy.min);
    fv.set(ResourcesMaxEntropy, entropy.max);
    fv.set(ResourcesMeanSize, size.mean);
    fv.set(ResourcesMinSize, size.min);
    fv.set(ResourcesMaxSize, size.max);

    fv.set(LoadConfigurationSize, view.load_config_size.unwrap_or(0) as f64);
    fv.set(VersionInformationSize, view.version_info_keys.unwrap_or(0) as f64);
    fv
}

/// Decode the file at `path` and extract its features.
pub fn extract_file(path: &Path) -> Result<FeatureVector> {
    let view = read_pe(path)?;
    Ok(extract(&view))
}
