/// Attributes of one remote file or directory as reported by the namenode.
///
/// Owner and group stay textual here; translating them to numeric ids is the
/// mount layer's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub mode: u16,
    pub owner: String,
    pub group: String,
    pub size: u64,
    pub mtime_ms: u64,
    pub is_dir: bool,
}

impl FileAttributes {
    pub fn file(mode: u16, size: u64) -> Self {
        Self {
            mode,
            owner: String::new(),
            group: String::new(),
            size,
            mtime_ms: 0,
            is_dir: false,
        }
    }

    pub fn dir(mode: u16) -> Self {
        Self {
            mode,
            owner: String::new(),
            group: String::new(),
            size: 0,
            mtime_ms: 0,
            is_dir: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub attrs: FileAttributes,
}

/// One directory listing, ordered by entry name.
#[derive(Debug, Clone, Default)]
pub struct DirListing {
    pub entries: Vec<DirEntry>,
}

impl DirListing {
    pub fn new(mut entries: Vec<DirEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self { entries }
    }
}
