//! Host information read through `sysinfo`

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

use super::{Capabilities, ExportContext, Exporter, KeyInfo, Plugin, PluginError, no_parameters};
use crate::Value;

pub struct SystemExporter {
    sys: Mutex<System>,
}

impl SystemExporter {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }

    fn with_system<T>(&self, f: impl FnOnce(&mut System) -> T) -> T {
        let mut guard = match self.sys.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn uname() -> String {
        [
            System::name(),
            System::host_name(),
            System::kernel_version(),
            System::os_version(),
            Some(System::cpu_arch()),
        ]
        .into_iter()
        .map(|part| part.unwrap_or_else(|| "unknown".to_string()))
        .collect::<Vec<_>>()
        .join(" ")
    }

    fn memory(&self, params: &[String]) -> Result<Value, PluginError> {
        if params.len() > 1 {
            return Err(PluginError::InvalidParameters("Too many parameters.".to_string()));
        }
        let mode = params.first().map(String::as_str).unwrap_or("");

        self.with_system(|sys| {
            sys.refresh_memory();
            let total = sys.total_memory();
            match mode {
                "" | "total" => Ok(Value::Unsigned(total)),
                "used" => Ok(Value::Unsigned(sys.used_memory())),
                "available" => Ok(Value::Unsigned(sys.available_memory())),
                "free" => Ok(Value::Unsigned(sys.free_memory())),
                "pused" if total > 0 => {
                    Ok(Value::Float(sys.used_memory() as f64 / total as f64 * 100.0))
                }
                "pused" => Err(PluginError::Unavailable(
                    "Cannot obtain total memory size.".to_string(),
                )),
                _ => Err(PluginError::InvalidParameters(
                    "Invalid first parameter.".to_string(),
                )),
            }
        })
    }

    /// `proc.num[<name>,<user>,<state>,<cmdline>]`; only name and cmdline
    /// filters are supported, cmdline takes a regex or `@expression`
    fn process_count(
        &self,
        params: &[String],
        context: &ExportContext,
    ) -> Result<Value, PluginError> {
        if params.len() > 4 {
            return Err(PluginError::InvalidParameters("Too many parameters.".to_string()));
        }
        let param = |i: usize| params.get(i).map(String::as_str).unwrap_or("");
        if !param(1).is_empty() || !param(2).is_empty() {
            return Err(PluginError::InvalidParameters(
                "User and state filters are not supported.".to_string(),
            ));
        }
        let name = param(0);
        let cmdline = param(3);

        let candidates: Vec<(String, String)> = self.with_system(|sys| {
            sys.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing().with_cmd(UpdateKind::OnlyIfNotSet),
            );
            sys.processes()
                .values()
                .map(|p| {
                    let cmd = p
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy())
                        .collect::<Vec<_>>()
                        .join(" ");
                    (p.name().to_string_lossy().into_owned(), cmd)
                })
                .collect()
        });

        let mut count = 0u64;
        for (process_name, cmd) in candidates {
            if !name.is_empty() && process_name != name {
                continue;
            }
            if !cmdline.is_empty() {
                let matched = context
                    .expressions
                    .matches(cmdline, &cmd)
                    .map_err(|e| PluginError::InvalidParameters(e.to_string()))?;
                if !matched {
                    continue;
                }
            }
            count += 1;
        }
        Ok(Value::Unsigned(count))
    }
}

impl Default for SystemExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exporter for SystemExporter {
    async fn export(
        &self,
        key: &str,
        params: &[String],
        context: &ExportContext,
    ) -> Result<Value, PluginError> {
        match key {
            "system.hostname" => {
                no_parameters(params)?;
                System::host_name().map(Value::Text).ok_or_else(|| {
                    PluginError::Unavailable("Cannot obtain host name.".to_string())
                })
            }
            "system.uname" => {
                no_parameters(params)?;
                Ok(Value::Text(Self::uname()))
            }
            "system.uptime" => {
                no_parameters(params)?;
                Ok(Value::Unsigned(System::uptime()))
            }
            "system.cpu.num" => {
                no_parameters(params)?;
                let count = self.with_system(|sys| {
                    sys.refresh_cpu_all();
                    sys.cpus().len()
                });
                Ok(Value::Unsigned(count as u64))
            }
            "vm.memory.size" => self.memory(params),
            "proc.num" => self.process_count(params, context),
            _ => Err(PluginError::UnsupportedKey),
        }
    }
}

pub fn plugin() -> Plugin {
    Plugin::new(
        "System",
        vec![
            KeyInfo::new("system.hostname", "Returns system host name."),
            KeyInfo::new("system.uname", "Returns system uname."),
            KeyInfo::new("system.uptime", "Returns system uptime in seconds."),
            KeyInfo::new("system.cpu.num", "Number of CPUs."),
            KeyInfo::new("vm.memory.size", "Memory size in bytes or in percentage from total.")
                .with_example("vm.memory.size[total]"),
            KeyInfo::new("proc.num", "The number of processes.").with_example("proc.num[]"),
        ],
        Capabilities::Exporter(Arc::new(SystemExporter::new())),
    )
}
