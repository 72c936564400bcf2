//! CPU utilisation
//!
//! The collector samples global usage once per second into a fixed ring of
//! fifteen minutes; the exporter averages the tail of that ring.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::System;
use tracing::trace;

use super::{Capabilities, Collector, ExportContext, Exporter, KeyInfo, Plugin, PluginError};
use crate::Value;

const SAMPLE_PERIOD: Duration = Duration::from_secs(1);
const MAX_SAMPLES: usize = 15 * 60;

#[derive(Debug)]
struct Samples {
    sys: System,
    history: VecDeque<f64>,
}

/// Shared state between the collector and exporter halves
#[derive(Debug, Clone)]
pub struct CpuStats {
    inner: Arc<Mutex<Samples>>,
}

impl CpuStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Samples {
                sys: System::new(),
                history: VecDeque::with_capacity(MAX_SAMPLES),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Samples> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, usage: f64) {
        let mut samples = self.lock();
        if samples.history.len() == MAX_SAMPLES {
            samples.history.pop_front();
        }
        samples.history.push_back(usage);
    }

    /// Mean over the newest `window` samples, or fewer if not yet gathered
    pub fn average(&self, window: usize) -> Option<f64> {
        let samples = self.lock();
        let taken = samples.history.len().min(window);
        if taken == 0 {
            return None;
        }
        let sum: f64 = samples.history.iter().rev().take(taken).sum();
        Some(sum / taken as f64)
    }
}

impl Default for CpuStats {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for CpuStats {
    async fn collect(&self) -> Result<(), PluginError> {
        let usage = {
            let mut samples = self.lock();
            samples.sys.refresh_cpu_usage();
            samples.sys.global_cpu_usage() as f64
        };
        trace!("cpu usage sample {:.2}", usage);
        self.push(usage);
        Ok(())
    }

    fn period(&self) -> Duration {
        SAMPLE_PERIOD
    }
}

#[async_trait]
impl Exporter for CpuStats {
    /// `system.cpu.util[<cpu>,<type>,<mode>]`
    async fn export(
        &self,
        key: &str,
        params: &[String],
        _context: &ExportContext,
    ) -> Result<Value, PluginError> {
        if key != "system.cpu.util" {
            return Err(PluginError::UnsupportedKey);
        }
        if params.len() > 3 {
            return Err(PluginError::InvalidParameters("Too many parameters.".to_string()));
        }
        let param = |i: usize| params.get(i).map(String::as_str).unwrap_or("");

        if !matches!(param(0), "" | "all") {
            return Err(PluginError::InvalidParameters(
                "Invalid first parameter.".to_string(),
            ));
        }
        if !matches!(param(1), "" | "total") {
            return Err(PluginError::InvalidParameters(
                "Invalid second parameter.".to_string(),
            ));
        }
        let window = match param(2) {
            "" | "avg1" => 60,
            "avg5" => 5 * 60,
            "avg15" => 15 * 60,
            _ => {
                return Err(PluginError::InvalidParameters(
                    "Invalid third parameter.".to_string(),
                ));
            }
        };

        self.average(window)
            .map(Value::Float)
            .ok_or_else(|| PluginError::Unavailable("No data gathered yet.".to_string()))
    }
}

pub fn plugin() -> Plugin {
    let stats = Arc::new(CpuStats::new());
    Plugin::new(
        "Cpu",
        vec![
            KeyInfo::new("system.cpu.util", "CPU utilization percentage.")
                .with_example("system.cpu.util[,,avg1]"),
        ],
        Capabilities::CollectorExporter {
            collector: stats.clone(),
            exporter: stats,
        },
    )
}
