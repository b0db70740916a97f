use std::sync::{Arc, Mutex};

use log::kv::{Error, Key, Value, VisitSource};

/// Record as seen by [`CaptureLog`].
#[derive(Debug, Clone)]
pub(crate) struct Captured {
    pub level: log::Level,
    pub message: String,
    pub target: String,
    pub file: Option<String>,
    fields: Vec<(String, String, Option<u64>, Option<bool>)>,
}

impl Captured {
    pub fn str(&self, key: &str) -> Option<&str> {
        self.find(key).map(|(_, v, _, _)| v.as_str())
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        self.find(key).and_then(|(_, _, v, _)| *v)
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.find(key).and_then(|(_, _, _, v)| *v)
    }

    pub fn has(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.fields.iter().map(|(k, _, _, _)| k.as_str()).collect()
    }

    fn find(&self, key: &str) -> Option<&(String, String, Option<u64>, Option<bool>)> {
        self.fields.iter().find(|(k, _, _, _)| k == key)
    }
}

/// `log::Log` sink that keeps every record in memory.
#[derive(Debug, Default)]
pub(crate) struct CaptureLog {
    records: Mutex<Vec<Captured>>,
}

impl CaptureLog {
    pub fn new() -> Arc<Self> {
        Arc::new(CaptureLog::default())
    }

    pub fn records(&self) -> Vec<Captured> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

struct Collect<'a>(&'a mut Vec<(String, String, Option<u64>, Option<bool>)>);

impl<'kvs> VisitSource<'kvs> for Collect<'_> {
    fn visit_pair(&mut self, key: Key<'kvs>, value: Value<'kvs>) -> Result<(), Error> {
        self.0.push((
            key.as_str().to_string(),
            value.to_string(),
            value.to_u64(),
            value.to_bool(),
        ));
        Ok(())
    }
}

impl log::Log for CaptureLog {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut fields = Vec::new();
        record
            .key_values()
            .visit(&mut Collect(&mut fields))
            .unwrap();

        self.records.lock().unwrap().push(Captured {
            level: record.level(),
            message: record.args().to_string(),
            target: record.target().to_string(),
            file: record.file().map(str::to_string),
            fields,
        });
    }

    fn flush(&self) {}
}
