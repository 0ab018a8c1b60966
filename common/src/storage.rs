use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use log::{info, warn};

pub trait FileCounter {
    fn read(&mut self) -> io::Result<u8>;
    fn store(&mut self, value: u8) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryCounter {
    pub value: u8,
}

impl FileCounter for MemoryCounter {
    fn read(&mut self) -> io::Result<u8> {
        Ok(self.value)
    }

    fn store(&mut self, value: u8) -> io::Result<()> {
        self.value = value;
        Ok(())
    }
}

pub fn next_file_number(last: u8) -> u8 {
    last.wrapping_add(1)
}

pub fn file_path_for(number: u8) -> String {
    format!("/file_{number}.txt")
}

pub fn file_name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub struct SnapshotFileStore<C> {
    root: PathBuf,
    counter: C,
}

impl<C: FileCounter> SnapshotFileStore<C> {
    pub fn new(root: impl Into<PathBuf>, counter: C) -> Self {
        Self {
            root: root.into(),
            counter,
        }
    }

    pub fn resolve(&self, device_path: &str) -> PathBuf {
        self.root.join(device_path.trim_start_matches('/'))
    }

    /// Writes `data` to the next numbered file and returns its device path.
    /// The counter only advances once the bytes are on storage.
    pub fn write(&mut self, data: &[u8]) -> io::Result<String> {
        let number = next_file_number(self.counter.read()?);
        let device_path = file_path_for(number);
        let full_path = self.resolve(&device_path);

        let mut file = fs::File::create(&full_path).map_err(|err| {
            warn!("{} file FAILED OPEN in writing mode: {err}", full_path.display());
            err
        })?;
        file.write_all(data)?;
        file.flush()?;
        info!("{device_path} written ({} bytes)", data.len());

        self.counter.store(number)?;
        Ok(device_path)
    }

    pub fn open(&self, device_path: &str) -> io::Result<fs::File> {
        fs::File::open(self.resolve(device_path))
    }
}
