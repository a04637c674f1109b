use serde::{Deserialize, Serialize};
use std::fmt;

/// Every file type a descriptor may name. Names are resolved through
/// [`FileType::from_name`]; there is no open-ended lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    SingleFile,
    TextFile,
    LogFile,
    CsvFile,
    FileList,
    JsonFile,
    ImageFile,
    FileCollection,
}

const FILE_TYPE_TABLE: &[(&str, FileType)] = &[
    ("SingleFile", FileType::SingleFile),
    ("TextFile", FileType::TextFile),
    ("LogFile", FileType::LogFile),
    ("CsvFile", FileType::CsvFile),
    ("FileList", FileType::FileList),
    ("JsonFile", FileType::JsonFile),
    ("ImageFile", FileType::ImageFile),
    ("FileCollection", FileType::FileCollection),
];

impl FileType {
    pub fn as_str(self) -> &'static str {
        FILE_TYPE_TABLE
            .iter()
            .find(|(_, ty)| *ty == self)
            .map(|(name, _)| *name)
            .unwrap_or("SingleFile")
    }

    pub fn from_name(name: &str) -> Option<FileType> {
        FILE_TYPE_TABLE
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, ty)| *ty)
    }

    pub fn supported_names() -> Vec<&'static str> {
        FILE_TYPE_TABLE.iter().map(|(name, _)| *name).collect()
    }

    pub fn parent(self) -> Option<FileType> {
        match self {
            Self::SingleFile | Self::FileCollection => None,
            Self::TextFile | Self::ImageFile => Some(Self::SingleFile),
            Self::LogFile | Self::CsvFile | Self::JsonFile => Some(Self::TextFile),
            Self::FileList => Some(Self::CsvFile),
        }
    }

    /// True when `self` is `ancestor` or one of its descendants.
    pub fn is_a(self, ancestor: FileType) -> bool {
        let mut current = Some(self);
        while let Some(ty) = current {
            if ty == ancestor {
                return true;
            }
            current = ty.parent();
        }
        false
    }

    /// `SingleFile` or `FileCollection`, the root of this type's hierarchy.
    pub fn top_level(self) -> FileType {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Type for a newly produced output, guessed from its name.
    pub fn suggest(name: &str, is_dir: bool) -> FileType {
        if is_dir {
            return Self::FileCollection;
        }
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".cbcsv") || lower.ends_with(".filelist.csv") {
            Self::FileList
        } else if lower.ends_with(".csv") || lower.ends_with(".tsv") {
            Self::CsvFile
        } else if lower.ends_with(".log") {
            Self::LogFile
        } else if lower.ends_with(".json") {
            Self::JsonFile
        } else if lower.ends_with(".txt") || lower.ends_with(".md") {
            Self::TextFile
        } else if [".nii", ".nii.gz", ".mnc", ".png", ".jpg", ".tif"]
            .iter()
            .any(|ext| lower.ends_with(ext))
        {
            Self::ImageFile
        } else {
            Self::SingleFile
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
