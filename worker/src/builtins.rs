//! Invokables que trae el runtime.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use crate::environment::TaskContext;
use crate::error::TaskError;
use crate::invokable::{Invokable, InvokableRegistry};

const DEFAULT_MAX_IN_MEM_KEYS: usize = 100_000;
/// Cada cuántos registros las fuentes miran si las cancelaron.
const CANCEL_CHECK_EVERY: u64 = 4096;

pub(crate) fn register_all(registry: &InvokableRegistry) {
    registry.register("sequence_source", |cfg| {
        let count = cfg
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("falta `count`"))?;
        Ok(Box::new(SequenceSource { count }))
    });
    registry.register("split_source", |_| Ok(Box::new(SplitSource)));
    registry.register("forward", |_| Ok(Box::new(Forward)));
    registry.register("file_sink", |cfg| {
        let path = cfg
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("falta `path`"))?;
        Ok(Box::new(FileSink {
            path: PathBuf::from(path),
        }))
    });
    registry.register("discard_sink", |_| Ok(Box::new(DiscardSink)));
    registry.register("count_by_key", |cfg| {
        let key = cfg
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("falta `key`"))?
            .to_string();
        let threshold = cfg
            .get("max_in_memory_keys")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_IN_MEM_KEYS)
            .max(1);
        Ok(Box::new(CountByKey { key, threshold }))
    });
}

fn check_cancel(ctx: &TaskContext, n: u64) -> Result<(), TaskError> {
    if n % CANCEL_CHECK_EVERY == 0 && ctx.is_cancelled() {
        return Err(TaskError::Cancelled);
    }
    Ok(())
}

/// `count` -> 0, 1, ..., count-1.
struct SequenceSource {
    count: u64,
}

impl Invokable for SequenceSource {
    fn invoke(&mut self, ctx: &mut TaskContext) -> Result<()> {
        for i in 0..self.count {
            check_cancel(ctx, i)?;
            ctx.emit(json!(i))?;
        }
        ctx.accumulators().add("records_out", self.count as i64);
        Ok(())
    }
}

/// Pide splits hasta que no quedan. Un split `{"path": ...}` se lee
/// como texto, una línea por registro `{"text": ...}`; cualquier otro
/// payload se emite tal cual.
struct SplitSource;

impl Invokable for SplitSource {
    fn invoke(&mut self, ctx: &mut TaskContext) -> Result<()> {
        let mut emitted = 0u64;
        while let Some(split) = ctx.next_split()? {
            match split.payload.get("path").and_then(Value::as_str) {
                Some(path) => {
                    let file = File::open(path)
                        .with_context(|| format!("no se pudo abrir el split {}", path))?;
                    for line in BufReader::new(file).lines() {
                        check_cancel(ctx, emitted)?;
                        ctx.emit(json!({ "text": line? }))?;
                        emitted += 1;
                    }
                }
                None => {
                    ctx.emit(split.payload)?;
                    emitted += 1;
                }
            }
        }
        ctx.accumulators().add("records_out", emitted as i64);
        Ok(())
    }
}

struct Forward;

impl Invokable for Forward {
    fn invoke(&mut self, ctx: &mut TaskContext) -> Result<()> {
        while let Some(batch) = ctx.next_batch()? {
            for r in batch {
                ctx.emit(r)?;
            }
        }
        Ok(())
    }
}

/// Un valor JSON por línea.
struct FileSink {
    path: PathBuf,
}

impl Invokable for FileSink {
    fn invoke(&mut self, ctx: &mut TaskContext) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&self.path)
            .with_context(|| format!("no se pudo crear {}", self.path.display()))?;
        let mut writer = BufWriter::new(file);

        let mut written = 0i64;
        while let Some(batch) = ctx.next_batch()? {
            for r in batch {
                serde_json::to_writer(&mut writer, &r)?;
                writer.write_all(b"\n")?;
                written += 1;
            }
        }
        writer.flush()?;
        ctx.accumulators().add("records_written", written);
        Ok(())
    }
}

struct DiscardSink;

impl Invokable for DiscardSink {
    fn invoke(&mut self, ctx: &mut TaskContext) -> Result<()> {
        let mut seen = 0i64;
        while let Some(batch) = ctx.next_batch()? {
            seen += batch.len() as i64;
        }
        ctx.accumulators().add("records_discarded", seen);
        Ok(())
    }
}

/// Suma `count` (1 si falta) por el campo `key` y emite
/// `{ key: <clave>, "count": <suma> }` ordenado por clave.
struct CountByKey {
    key: String,
    threshold: usize,
}

impl Invokable for CountByKey {
    fn invoke(&mut self, ctx: &mut TaskContext) -> Result<()> {
        let mut agg = SpillingAggregator::new(self.threshold);

        while let Some(batch) = ctx.next_batch()? {
            for r in batch {
                let key = match r.get(&self.key) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => continue,
                };
                let count = r.get("count").and_then(Value::as_u64).unwrap_or(1);
                agg.add(ctx, key, count)?;
            }
        }

        let spills = agg.spill_files.len() as i64;
        for (k, v) in agg.finish()? {
            let mut row = serde_json::Map::new();
            row.insert(self.key.clone(), Value::String(k));
            row.insert("count".to_string(), json!(v));
            ctx.emit(Value::Object(row))?;
        }
        ctx.accumulators().add("spills", spills);
        Ok(())
    }
}

/// Acumulador clave→valor con spill a disco cuando el mapa crece demasiado.
/// Los archivos de spill son temporales de la tarea.
struct SpillingAggregator {
    map: HashMap<String, u64>,
    spill_files: Vec<PathBuf>,
    threshold: usize,
}

impl SpillingAggregator {
    fn new(threshold: usize) -> Self {
        Self {
            map: HashMap::new(),
            spill_files: Vec::new(),
            threshold,
        }
    }

    fn add(&mut self, ctx: &TaskContext, key: String, value: u64) -> Result<()> {
        *self.map.entry(key).or_insert(0) += value;
        if self.map.len() >= self.threshold {
            self.spill(ctx)?;
        }
        Ok(())
    }

    fn spill(&mut self, ctx: &TaskContext) -> Result<()> {
        if self.map.is_empty() {
            return Ok(());
        }

        let path = ctx.scratch_file("spill")?;
        let mut writer = BufWriter::new(File::create(&path)?);
        for (k, v) in self.map.drain() {
            serde_json::to_writer(&mut writer, &json!({ "k": k, "v": v }))
                .with_context(|| format!("error al escribir spill en {}", path.display()))?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        self.spill_files.push(path);
        Ok(())
    }

    /// Combina mapa en memoria + spills.
    fn finish(mut self) -> Result<Vec<(String, u64)>> {
        let mut acc: HashMap<String, u64> = self.map.drain().collect();

        for path in &self.spill_files {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let v: Value = serde_json::from_str(&line)
                    .with_context(|| format!("error al parsear spill {}", path.display()))?;
                let key = v.get("k").and_then(Value::as_str).unwrap_or("").to_string();
                let val = v.get("v").and_then(Value::as_u64).unwrap_or(0);
                *acc.entry(key).or_insert(0) += val;
            }
        }

        let mut entries: Vec<(String, u64)> = acc.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
