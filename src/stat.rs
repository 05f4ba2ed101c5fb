#[derive(Copy, Clone, PartialEq, Eq)]
pub enum FileType {
    NO_TYPE,
    T_DIR, // Directory
    T_FILE, // File
    T_DEVICE, // Device
}

#[derive(Copy, Clone)]
pub struct Stat {
    pub(crate) dev: i32, // File system's disk device
    pub(crate) ino: u32, // Inode number
    pub(crate) file_type: FileType, // Type of file
    pub(crate) nlink: i16, // Number of links to file
    pub(crate) size: usize, // Size of file in bytes
}

impl Stat {
    pub const fn create() -> Self {
        Self {
            dev: 0,
            ino: 0,
            file_type: FileType::NO_TYPE,
            nlink: 0,
            size: 0,
        }
    }
}
