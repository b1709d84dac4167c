use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Result, Write};
use std::path::PathBuf;

// Checkpoint files get the careful treatment: buffered writes, then an
// explicit flush-and-sync before the writer reports success, because
// the store's durability contract is "complete_output returned true,
// therefore the bytes are on disk".

pub struct CkptWriter {
    file: BufWriter<File>,
    path: PathBuf,
}

impl CkptWriter {
    pub fn create(path: PathBuf) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let file = BufWriter::new(file);
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Flush, sync and close. Nothing is durable until this returns.
    pub fn finish(self) -> Result<()> {
        let Self { mut file, path: _ } = self;
        file.flush()?;
        let file = file.into_inner()?;
        file.sync_all()?;
        Ok(())
    }
}

impl Write for CkptWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.file.write(buf)
    }
    fn flush(&mut self) -> Result<()> {
        self.file.flush()
    }
}

pub struct CkptReader {
    file: BufReader<File>,
}

impl CkptReader {
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = File::open(&path)?;
        Ok(Self {
            file: BufReader::new(file),
        })
    }

    pub fn read_all(mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Read for CkptReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.file.read(buf)
    }
}
