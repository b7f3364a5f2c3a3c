//! Per-node resource limits.
//!
//! Limits arrive as strings from the deployment document ("1.5", "5GB") and
//! are validated once into [`Limits`]. An empty string means "no limit",
//! never zero.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Smallest memory limit the container engine accepts.
pub const MIN_MEMORY: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpus: String,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// Validated form of [`Resources`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Limits {
    pub cpus: Option<f64>,
    /// Bytes.
    pub memory: Option<u64>,
    pub ports: Vec<String>,
    pub volumes: Vec<String>,
}

impl Limits {
    pub fn is_unlimited(&self) -> bool {
        self.cpus.is_none() && self.memory.is_none()
    }
}

impl Resources {
    pub fn validate(&self) -> Result<Limits> {
        for port in &self.ports {
            validate_port(port)?;
        }
        for volume in &self.volumes {
            validate_volume(volume)?;
        }
        Ok(Limits {
            cpus: parse_cpus(&self.cpus)?,
            memory: parse_memory(&self.memory)?,
            ports: self.ports.clone(),
            volumes: self.volumes.clone(),
        })
    }
}

pub fn parse_cpus(value: &str) -> Result<Option<f64>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    let cpus: f64 = value
        .parse()
        .map_err(|_| Error::validation(format!("invalid cpus value: {:?}", value)))?;
    if !cpus.is_finite() || cpus <= 0.0 {
        return Err(Error::validation(format!(
            "cpus must be a positive number, got {}",
            value
        )));
    }
    Ok(Some(cpus))
}

/// Parses "512MB", "5GB", "1.5g", "1048576" into bytes. Multiples are binary.
pub fn parse_memory(value: &str) -> Result<Option<u64>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| Error::validation(format!("invalid memory value: {:?}", value)))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        other => {
            return Err(Error::validation(format!(
                "unknown memory unit {:?} in {:?}",
                other, value
            )))
        }
    };

    let bytes = (number * multiplier as f64).round();
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(Error::validation(format!("memory value out of range: {}", value)));
    }
    let bytes = bytes as u64;
    if bytes < MIN_MEMORY {
        return Err(Error::validation(format!(
            "memory limit {} is below the 4MiB minimum",
            value
        )));
    }
    Ok(Some(bytes))
}

/// `[host_ip:]host_port:container_port[/proto]` or a bare container port.
fn validate_port(port: &str) -> Result<()> {
    let (mapping, proto) = match port.split_once('/') {
        Some((mapping, proto)) => (mapping, Some(proto)),
        None => (port, None),
    };
    if let Some(proto) = proto {
        if proto != "tcp" && proto != "udp" {
            return Err(Error::validation(format!("invalid protocol in port {:?}", port)));
        }
    }
    let parts: Vec<&str> = mapping.split(':').collect();
    let numeric = match parts.len() {
        1 => &parts[..],
        2 => &parts[..],
        3 => &parts[1..],
        _ => return Err(Error::validation(format!("invalid port mapping {:?}", port))),
    };
    for part in numeric {
        part.parse::<u16>()
            .map_err(|_| Error::validation(format!("invalid port mapping {:?}", port)))?;
    }
    Ok(())
}

/// `host_path:container_path[:mode]`
fn validate_volume(volume: &str) -> Result<()> {
    let parts: Vec<&str> = volume.split(':').collect();
    let ok = match parts.len() {
        2 => !parts[0].is_empty() && !parts[1].is_empty(),
        3 => !parts[0].is_empty() && !parts[1].is_empty() && matches!(parts[2], "ro" | "rw"),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid volume {:?}", volume)))
    }
}
