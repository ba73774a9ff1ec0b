//! CNI command handlers
//!
//! One plugin process runs exactly one command. Each handler resolves the
//! configuration, performs a single allocator operation, then hands the
//! outcome to the plumbing.

use std::env;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{NetworkConfig, ResolvedConfig};
use crate::error::{CniError, CniErrorCode};
use crate::ipam::Ipam;
use crate::plumbing::NetworkPlumbing;
use crate::result::{CniResult, VersionResult};
use crate::store::FileStore;
use crate::veth::VethRequest;

/// Maximum size of network config input (1 MB should be more than enough)
const MAX_INPUT_SIZE: u64 = 1024 * 1024;

/// CNI Spec version supported by this plugin
pub const CNI_VERSION: &str = "1.0.0";

/// Supported CNI versions
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

impl FromStr for Command {
    type Err = CniError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Self::Add),
            "DEL" => Ok(Self::Del),
            "CHECK" => Ok(Self::Check),
            "VERSION" => Ok(Self::Version),
            _ => {
                // Truncate command for safety in error message (avoid log injection)
                let safe_command: String = s
                    .chars()
                    .take(32)
                    .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                    .collect();
                Err(CniError::env_error(&format!("unknown CNI_COMMAND: {}", safe_command)))
            }
        }
    }
}

/// Invocation parameters taken from the `CNI_*` environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniArgs {
    pub command: Command,
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
}

impl CniArgs {
    pub fn from_env() -> Result<Self, CniError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source, checking what each command requires
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CniError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let command: Command = lookup("CNI_COMMAND")
            .ok_or_else(|| CniError::env_error("CNI_COMMAND not set"))?
            .parse()?;

        let require = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| CniError::env_error(&format!("{} not set", key)))
        };

        let args = match command {
            Command::Version => Self {
                command,
                container_id: String::new(),
                netns: String::new(),
                ifname: String::new(),
            },
            // The namespace may already be gone when DEL arrives
            Command::Del => Self {
                command,
                container_id: require("CNI_CONTAINERID")?,
                netns: lookup("CNI_NETNS").unwrap_or_default(),
                ifname: require("CNI_IFNAME")?,
            },
            Command::Add | Command::Check => Self {
                command,
                container_id: require("CNI_CONTAINERID")?,
                netns: require("CNI_NETNS")?,
                ifname: require("CNI_IFNAME")?,
            },
        };

        Ok(args)
    }
}

/// Read network config from stdin (with size limit to prevent OOM)
pub fn read_stdin() -> Result<String, CniError> {
    let mut input = String::new();
    io::stdin()
        .take(MAX_INPUT_SIZE)
        .read_to_string(&mut input)
        .map_err(|e| CniError::io_error("failed to read stdin").with_details(&e.to_string()))?;
    Ok(input)
}

/// Run one command; results are written to `out`
pub fn dispatch<P, W>(args: &CniArgs, input: &str, plumbing: &P, out: &mut W) -> Result<(), CniError>
where
    P: NetworkPlumbing,
    W: Write,
{
    match args.command {
        Command::Version => cmd_version(out),
        Command::Add => cmd_add(args, &load_config(input)?, plumbing, out),
        Command::Del => cmd_del(args, &load_config(input)?, plumbing),
        Command::Check => cmd_check(args, &load_config(input)?, plumbing),
    }
}

fn load_config(input: &str) -> Result<ResolvedConfig, CniError> {
    let config = NetworkConfig::parse(input)?;

    if !SUPPORTED_VERSIONS.contains(&config.cni_version.as_str()) {
        return Err(CniError::new(
            CniErrorCode::IncompatibleVersion,
            &format!("unsupported cniVersion {}", config.cni_version),
        )
        .with_details(&format!("supported: {}", SUPPORTED_VERSIONS.join(", "))));
    }

    config.resolve()
}

fn open_ipam(conf: &ResolvedConfig) -> Result<Ipam<FileStore>, CniError> {
    let store = FileStore::open(&conf.data_dir, &conf.network)?;
    Ok(Ipam::new(&conf.subnet, store)?)
}

/// Handle ADD command - allocate an address and wire the container in
fn cmd_add<P: NetworkPlumbing, W: Write>(
    args: &CniArgs,
    conf: &ResolvedConfig,
    plumbing: &P,
    out: &mut W,
) -> Result<(), CniError> {
    let mut ipam = open_ipam(conf)?;
    let gateway = ipam.gateway();

    let pod_ip = ipam.allocate_ip(&args.container_id, &args.ifname)?;
    let address = ipam.ip_net(pod_ip);

    // A failure from here on leaves the allocation in place; the runtime
    // follows a failed ADD with DEL, which releases it.
    let bridge_index = plumbing.ensure_bridge(&conf.bridge, conf.mtu, ipam.gateway_net())?;

    let pair = plumbing.setup_veth(&VethRequest {
        container_id: &args.container_id,
        netns: &args.netns,
        ifname: &args.ifname,
        mtu: conf.mtu,
        address,
        gateway,
        bridge_index,
    })?;

    let result = CniResult::new(conf.cni_version.clone())
        .with_interface(pair.container_ifname, pair.mac_address, Some(args.netns.clone()))
        .with_ip(address, Some(gateway), 0)
        .with_route("0.0.0.0/0".to_string(), Some(gateway));

    info!(
        container_id = %args.container_id,
        network = %conf.network,
        %address,
        "ADD complete"
    );

    print_json(out, &result)
}

/// Handle DEL command - release the address, then remove the interface
fn cmd_del<P: NetworkPlumbing>(args: &CniArgs, conf: &ResolvedConfig, plumbing: &P) -> Result<(), CniError> {
    let mut ipam = open_ipam(conf)?;
    ipam.release_ip(&args.container_id)?;

    plumbing.teardown_veth(&args.netns, &args.ifname)?;

    info!(container_id = %args.container_id, network = %conf.network, "DEL complete");
    Ok(())
}

/// Handle CHECK command - the allocation and the interface must both still exist
fn cmd_check<P: NetworkPlumbing>(args: &CniArgs, conf: &ResolvedConfig, plumbing: &P) -> Result<(), CniError> {
    let mut ipam = open_ipam(conf)?;
    let pod_ip = ipam.check_ip(&args.container_id)?;

    plumbing.verify_veth(&args.netns, &args.ifname, pod_ip)?;

    info!(container_id = %args.container_id, ip = %pod_ip, "CHECK passed");
    Ok(())
}

/// Handle VERSION command - report supported CNI versions
fn cmd_version<W: Write>(out: &mut W) -> Result<(), CniError> {
    let result = VersionResult {
        cni_version: CNI_VERSION.to_string(),
        supported_versions: SUPPORTED_VERSIONS.iter().map(|s| s.to_string()).collect(),
    };
    print_json(out, &result)
}

fn print_json<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<(), CniError> {
    let json = serde_json::to_string(value).map_err(|e| {
        CniError::io_error("failed to serialize result").with_details(&e.to_string())
    })?;
    writeln!(out, "{}", json)
        .map_err(|e| CniError::io_error("failed to write result").with_details(&e.to_string()))
}

/// CNI error object for a failed command
pub fn error_json(e: &CniError) -> String {
    let error_output = serde_json::json!({
        "cniVersion": CNI_VERSION,
        "code": e.code() as u32,
        "msg": e.message(),
        "details": e.details(),
    });

    serde_json::to_string(&error_output).unwrap_or_else(|err| {
        warn!(error = %err, "failed to encode error object");
        format!(
            r#"{{"cniVersion":"{}","code":{},"msg":"{}"}}"#,
            CNI_VERSION,
            e.code() as u32,
            e.message().replace('"', "'")
        )
    })
}
