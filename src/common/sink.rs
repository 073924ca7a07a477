use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use super::error::Error;

/// Ordered destination for decision and delivery records.
pub trait Sink: Send + 'static {
    fn record(&mut self, line: &str) -> Result<(), Error>;

    fn flush(&mut self) -> Result<(), Error>;
}

/// Sink shared between workers. Every record is a single short critical section.
pub type SharedSink = Arc<Mutex<Box<dyn Sink>>>;

pub fn shared(sink: impl Sink) -> SharedSink {
    Arc::new(Mutex::new(Box::new(sink)))
}

pub fn lock(sink: &SharedSink) -> Result<MutexGuard<'_, Box<dyn Sink>>, Error> {
    sink.lock().map_err(|_| Error::Sink("poisoned".to_string()))
}

pub fn record(sink: &SharedSink, line: &str) -> Result<(), Error> {
    lock(sink)?.record(line)
}

pub fn flush(sink: &SharedSink) -> Result<(), Error> {
    lock(sink)?.flush()
}

pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self, Error> {
        Ok(FileSink {
            writer: BufWriter::new(File::create(path)?),
        })
    }
}

impl Sink for FileSink {
    fn record(&mut self, line: &str) -> Result<(), Error> {
        writeln!(self.writer, "{line}")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps records in memory. Clones observe the same lines.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MemorySink {
    pub lines: Arc<Mutex<Vec<String>>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Sink for MemorySink {
    fn record(&mut self, line: &str) -> Result<(), Error> {
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
