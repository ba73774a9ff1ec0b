//! Status command implementation
//!
//! Shows the subnet, its gateway and every allocated address.

use anyhow::Result;
use bridgenet_cni::store::Allocation;
use bridgenet_cni::{AllocationStore, Ipam};
use colored::Colorize;
use ipnet::Ipv4Net;
use serde::Serialize;
use std::net::Ipv4Addr;
use tabled::{settings::Style, Table, Tabled};

use crate::cli::StatusArgs;
use crate::config::Config;

/// Box drawing characters for the summary
mod box_chars {
    pub const TOP_LEFT: &str = "\u{256D}";
    pub const TOP_RIGHT: &str = "\u{256E}";
    pub const BOTTOM_LEFT: &str = "\u{2570}";
    pub const BOTTOM_RIGHT: &str = "\u{256F}";
    pub const HORIZONTAL: &str = "\u{2500}";
    pub const VERTICAL: &str = "\u{2502}";
    pub const T_RIGHT: &str = "\u{251C}";
    pub const T_LEFT: &str = "\u{2524}";
}

/// Box width for the summary display
const BOX_WIDTH: usize = 55;

/// Width of the label column inside the box
const LABEL_WIDTH: usize = 12;

/// Usage above this percentage is shown as a warning
const USAGE_WARN_PERCENT: f64 = 80.0;

/// Container IDs are shortened like `podman ps` does
const SHORT_ID_LEN: usize = 12;

/// Full allocation status for JSON output
#[derive(Debug, Clone, Serialize)]
struct AllocationStatus {
    network: String,
    subnet: Ipv4Net,
    gateway: Ipv4Addr,
    allocated: usize,
    capacity: u32,
    allocations: Vec<Allocation>,
}

/// One table row
#[derive(Debug, Clone, Tabled)]
struct AllocationRow {
    #[tabled(rename = "IP")]
    ip: String,

    #[tabled(rename = "CONTAINER ID")]
    container_id: String,

    #[tabled(rename = "INTERFACE")]
    if_name: String,
}

impl From<&Allocation> for AllocationRow {
    fn from(a: &Allocation) -> Self {
        Self {
            ip: a.ip.to_string(),
            container_id: a.container_id.chars().take(SHORT_ID_LEN).collect(),
            if_name: a.if_name.clone(),
        }
    }
}

/// Run the status command
pub fn run(config: &Config, args: StatusArgs) -> Result<()> {
    let mut ipam = super::open_ipam(config)?;
    let status = collect_status(&config.store.network, &mut ipam)?;

    if args.json {
        print_json_status(&status)?;
    } else {
        print_formatted_status(&status, config.color_enabled());
    }

    Ok(())
}

fn collect_status<S: AllocationStore>(network: &str, ipam: &mut Ipam<S>) -> Result<AllocationStatus> {
    let allocations = ipam.allocations()?;

    Ok(AllocationStatus {
        network: network.to_string(),
        subnet: ipam.subnet(),
        gateway: ipam.gateway(),
        allocated: allocations.len(),
        capacity: ipam.capacity(),
        allocations,
    })
}

fn usage_percent(allocated: usize, capacity: u32) -> f64 {
    if capacity == 0 {
        return 100.0;
    }
    allocated as f64 * 100.0 / f64::from(capacity)
}

/// Print status in JSON format
fn print_json_status(status: &AllocationStatus) -> Result<()> {
    let json = serde_json::to_string_pretty(status)?;
    println!("{}", json);
    Ok(())
}

/// Print the summary box followed by the allocation table
fn print_formatted_status(status: &AllocationStatus, use_color: bool) {
    print_box_line(box_chars::TOP_LEFT, box_chars::TOP_RIGHT, use_color);
    print_box_row("Bridgenet Allocations", "", use_color);
    print_box_line(box_chars::T_RIGHT, box_chars::T_LEFT, use_color);

    print_box_row("Network", &status.network, use_color);
    print_box_row("Subnet", &status.subnet.to_string(), use_color);
    print_box_row("Gateway", &status.gateway.to_string(), use_color);

    let percent = usage_percent(status.allocated, status.capacity);
    let usage = format!("{}/{} ({:.1}%)", status.allocated, status.capacity, percent);
    let usage = if !use_color {
        usage
    } else if status.allocated as u64 >= u64::from(status.capacity) {
        usage.red().to_string()
    } else if percent >= USAGE_WARN_PERCENT {
        usage.yellow().to_string()
    } else {
        usage.green().to_string()
    };
    print_box_row("Allocated", &usage, use_color);

    print_box_line(box_chars::BOTTOM_LEFT, box_chars::BOTTOM_RIGHT, use_color);
    println!();

    if status.allocations.is_empty() {
        if use_color {
            println!("{}", "No addresses allocated.".dimmed());
        } else {
            println!("No addresses allocated.");
        }
        return;
    }

    let rows: Vec<AllocationRow> = status.allocations.iter().map(AllocationRow::from).collect();
    let table = Table::new(rows).with(Style::blank()).to_string();
    println!("{}", table);
}

/// Print a horizontal box border
fn print_box_line(left: &str, right: &str, use_color: bool) {
    let line = format!("{}{}{}", left, box_chars::HORIZONTAL.repeat(BOX_WIDTH - 2), right);
    if use_color {
        println!("{}", line.bright_black());
    } else {
        println!("{}", line);
    }
}

/// Print "│ Label       value │", padding on the visible width of `value`
fn print_box_row(label: &str, value: &str, use_color: bool) {
    let visible = label.chars().count().max(LABEL_WIDTH) + strip_ansi_len(value);
    let padding = (BOX_WIDTH - 4).saturating_sub(visible);

    let label = format!("{:<width$}", label, width = LABEL_WIDTH);
    let (border, label) = if use_color {
        (box_chars::VERTICAL.bright_black().to_string(), label.bold().to_string())
    } else {
        (box_chars::VERTICAL.to_string(), label)
    };

    println!("{} {}{}{} {}", border, label, value, " ".repeat(padding), border);
}

/// Length of a string ignoring ANSI color escapes
fn strip_ansi_len(s: &str) -> usize {
    let mut len = 0;
    let mut in_escape = false;
    for c in s.chars() {
        if in_escape {
            if c == 'm' {
                in_escape = false;
            }
        } else if c == '\x1B' {
            in_escape = true;
        } else {
            len += 1;
        }
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridgenet_cni::MemoryStore;

    #[test]
    fn test_collect_status() {
        let mut ipam = Ipam::new("10.244.7.0/29", MemoryStore::new()).unwrap();
        ipam.allocate_ip("0123456789abcdef", "eth0").unwrap();
        ipam.allocate_ip("fedcba9876543210", "eth1").unwrap();

        let status = collect_status("lab", &mut ipam).unwrap();
        assert_eq!(status.network, "lab");
        assert_eq!(status.gateway, Ipv4Addr::new(10, 244, 7, 1));
        assert_eq!(status.allocated, 2);
        assert_eq!(status.capacity, 5);
        assert_eq!(status.allocations[0].ip, Ipv4Addr::new(10, 244, 7, 2));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["subnet"], "10.244.7.0/29");
        assert_eq!(json["allocations"][1]["container_id"], "fedcba9876543210");
    }

    #[test]
    fn test_row_shortens_container_id() {
        let row = AllocationRow::from(&Allocation {
            ip: Ipv4Addr::new(10, 0, 0, 2),
            container_id: "0123456789abcdef0123".to_string(),
            if_name: "eth0".to_string(),
        });
        assert_eq!(row.container_id, "0123456789ab");
    }

    #[test]
    fn test_usage_percent() {
        assert_eq!(usage_percent(0, 253), 0.0);
        assert_eq!(usage_percent(1, 4), 25.0);
        assert_eq!(usage_percent(0, 0), 100.0);
    }

    #[test]
    fn test_strip_ansi_len() {
        assert_eq!(strip_ansi_len("abc"), 3);
        assert_eq!(strip_ansi_len("\x1B[32mabc\x1B[0m"), 3);
    }
}
