//! Lifecycle operations on fleet containers.
//!
//! Every operation runs one or more runtime commands and then mutates the
//! record store, which flushes. A failed command leaves the store untouched.

use crate::config::LifecycleConfig;
use crate::error::{FleetError, FleetResult};
use crate::locks::ContainerLocks;
use crate::runtime::RuntimeCli;
use chrono::{DateTime, Utc};
use fleet_proto::{Capability, LifecycleState, TenantId, VpsRecord, VpsStatus};
use fleet_runner::{
    Addresses, CommandOutput, CommandRunner, QUICK_TIMEOUT, RawOutput, display_command,
    get_addresses, parse_snapshots,
};
use fleet_store::RecordStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Record store shared between the manager and its callers.
pub type SharedStore = Arc<RwLock<RecordStore>>;

/// Per-stream cap on `exec` output, in characters.
pub const OUTPUT_LIMIT: usize = 1000;

pub const TRUNCATION_MARKER: &str = "\n... (truncated)";

// ─── Requests & Outcomes ──────────────────────────────────────────────────────

/// Parameters for a new container. Quantities are signed so that bad
/// caller input is rejected here instead of wrapping.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub owner_id: TenantId,
    pub ram_gb: i64,
    pub cpu_cores: i64,
    pub static_ipv4: Option<String>,
    pub static_ipv6: Option<String>,
    pub plan: Option<String>,
    pub processor: Option<String>,
    pub storage_gb: Option<u32>,
}

impl CreateRequest {
    pub fn new(owner_id: impl Into<TenantId>, ram_gb: i64, cpu_cores: i64) -> Self {
        Self { owner_id: owner_id.into(), ram_gb, cpu_cores, ..Self::default() }
    }

    pub fn with_static_ip(mut self, ipv4: Option<String>, ipv6: Option<String>) -> Self {
        self.static_ipv4 = ipv4;
        self.static_ipv6 = ipv6;
        self
    }
}

/// Requested static addresses, already parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticIp {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl StaticIp {
    /// Blank strings count as absent.
    pub fn parse(ipv4: Option<&str>, ipv6: Option<&str>) -> FleetResult<Self> {
        Ok(Self { ipv4: parse_addr(ipv4, "IPv4")?, ipv6: parse_addr(ipv6, "IPv6")? })
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }
}

fn parse_addr<T: std::str::FromStr>(raw: Option<&str>, family: &str) -> FleetResult<Option<T>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| FleetError::Validation(format!("'{s}' is not a valid {family} address"))),
    }
}

/// Non-fatal conditions reported alongside a successful operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// The container was created but kept its dynamic addresses.
    StaticIpFallback { reason: String },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StaticIpFallback { reason } => {
                write!(f, "static IP could not be applied, using dynamic addresses: {reason}")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub record: VpsRecord,
    /// 1-based position in the owner's list.
    pub vps_number: usize,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseOutcome {
    #[serde(flatten)]
    pub created: CreateOutcome,
    pub price: u64,
    pub balance: u64,
}

/// Result of a shell command run inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub truncated: bool,
}

impl ExecOutput {
    fn from_raw(raw: RawOutput) -> Self {
        let (stdout, out_cut) = truncate_output(&raw.stdout);
        let (stderr, err_cut) = truncate_output(&raw.stderr);
        Self { stdout, stderr, exit_code: raw.code, truncated: out_cut || err_cut }
    }
}

/// A temporary tmate session inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SshSession {
    pub session: String,
    /// Connection command, e.g. `ssh token@host`.
    pub command: String,
}

/// Cap `text` at [`OUTPUT_LIMIT`] characters, appending the marker when cut.
pub fn truncate_output(text: &str) -> (String, bool) {
    match text.char_indices().nth(OUTPUT_LIMIT) {
        Some((cut, _)) => (format!("{}{TRUNCATION_MARKER}", &text[..cut]), true),
        None => (text.to_string(), false),
    }
}

/// `session-<YYYYmmddHHMMSS>` in UTC.
pub fn session_name(at: DateTime<Utc>) -> String {
    format!("session-{}", at.format("%Y%m%d%H%M%S"))
}

/// First `ssh ...` line of tmate's display output.
fn parse_ssh_command(text: &str) -> Option<String> {
    text.lines().map(str::trim).find(|line| line.starts_with("ssh ")).map(String::from)
}

/// `<id>-backup-<YYYYmmdd-HHMMSS>` in UTC.
pub fn snapshot_name(container_id: &str, at: DateTime<Utc>) -> String {
    format!("{container_id}-backup-{}", at.format("%Y%m%d-%H%M%S"))
}

// ─── Authorization ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Access {
    /// Owner, shared tenant or admin.
    Operator,
    /// The owner and nobody else.
    Owner,
    Admin,
}

fn authorize(cap: Capability, access: Access, action: &str) -> FleetResult<()> {
    let allowed = match access {
        Access::Operator => matches!(
            cap,
            Capability::Owner | Capability::Shared | Capability::Admin | Capability::SuperAdmin
        ),
        Access::Owner => cap.is_owner(),
        Access::Admin => cap.is_admin(),
    };
    if allowed {
        Ok(())
    } else {
        Err(FleetError::PermissionDenied(format!("{cap} capability cannot {action}")))
    }
}

/// Container and snapshot names go straight onto the runtime command line.
fn validate_name(kind: &str, name: &str) -> FleetResult<()> {
    let well_formed = !name.is_empty()
        && !name.starts_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if well_formed {
        Ok(())
    } else {
        Err(FleetError::Validation(format!("invalid {kind} '{name}'")))
    }
}

fn positive(what: &str, value: i64) -> FleetResult<u32> {
    u32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| FleetError::Validation(format!("{what} must be a positive whole number, got {value}")))
}

fn not_found(container_id: &str) -> FleetError {
    FleetError::NotFound(format!("VPS '{container_id}'"))
}

// ─── In-flight bookkeeping ────────────────────────────────────────────────────

/// Holds a container id out of allocation until dropped.
struct Reservation<'a> {
    reserved: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.id);
    }
}

/// Marks a container as provisioning or reinstalling until dropped.
struct InFlight<'a> {
    states: &'a Mutex<HashMap<String, LifecycleState>>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.states.lock().remove(&self.id);
    }
}

struct Provision {
    owner_id: TenantId,
    ram: u32,
    cpu: u32,
    storage: u32,
    static_ip: StaticIp,
    plan: Option<String>,
    processor: Option<String>,
}

// ─── Manager ──────────────────────────────────────────────────────────────────

pub struct LifecycleManager {
    runner: Arc<dyn CommandRunner>,
    store: SharedStore,
    cli: RuntimeCli,
    config: LifecycleConfig,
    locks: ContainerLocks,
    reserved: Mutex<HashSet<String>>,
    in_flight: Mutex<HashMap<String, LifecycleState>>,
}

impl LifecycleManager {
    pub fn new(runner: Arc<dyn CommandRunner>, store: SharedStore, config: LifecycleConfig) -> Self {
        Self {
            runner,
            store,
            cli: RuntimeCli::from_config(&config),
            config,
            locks: ContainerLocks::new(),
            reserved: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn locks(&self) -> &ContainerLocks {
        &self.locks
    }

    /// Current lifecycle state; `Deleted` when no record exists.
    pub async fn state_of(&self, container_id: &str) -> LifecycleState {
        let pending = self.in_flight.lock().get(container_id).copied();
        if let Some(state) = pending {
            return state;
        }
        match self.store.read().await.find(container_id) {
            Some(record) => record.status.into(),
            None => LifecycleState::Deleted,
        }
    }

    // ─── Create & Purchase ───────────────────────────────────────────────

    pub async fn create(&self, cap: Capability, request: CreateRequest) -> FleetResult<CreateOutcome> {
        authorize(cap, Access::Admin, "create a VPS")?;
        let provision = self.validate(request)?;
        self.provision(provision).await
    }

    /// Buy a catalog plan for `buyer`. Credits are charged only once the
    /// container exists.
    pub async fn purchase(
        &self,
        buyer: &str,
        plan: &str,
        processor: &str,
        static_ipv4: Option<String>,
        static_ipv6: Option<String>,
    ) -> FleetResult<PurchaseOutcome> {
        let entry = self
            .config
            .plan(plan)
            .ok_or_else(|| FleetError::NotFound(format!("plan '{plan}'")))?;
        let (processor, price) = entry.offer(processor).ok_or_else(|| {
            FleetError::NotFound(format!("processor '{processor}' for plan '{}'", entry.name))
        })?;

        let have = self.store.read().await.credits(buyer);
        if have < price {
            return Err(FleetError::InsufficientCredits { need: price, have });
        }

        let request = CreateRequest {
            owner_id: buyer.to_string(),
            ram_gb: i64::from(entry.ram_gb),
            cpu_cores: i64::from(entry.cpu),
            static_ipv4,
            static_ipv6,
            plan: Some(entry.name.clone()),
            processor: Some(processor.to_string()),
            storage_gb: Some(entry.storage_gb),
        };
        let created = self.provision(self.validate(request)?).await?;

        let balance = match self.store.write().await.debit(buyer, price) {
            Ok(balance) => balance,
            Err(e) => {
                error!(
                    tenant = %buyer,
                    container = %created.record.container_id,
                    error = %e,
                    "container created but the purchase could not be charged"
                );
                return Err(e.into());
            }
        };
        info!(tenant = %buyer, plan = %entry.name, price, balance, "plan purchased");
        Ok(PurchaseOutcome { created, price, balance })
    }

    fn validate(&self, request: CreateRequest) -> FleetResult<Provision> {
        if request.owner_id.trim().is_empty() {
            return Err(FleetError::Validation("owner id must not be empty".into()));
        }
        let ram = positive("RAM (GB)", request.ram_gb)?;
        let cpu = positive("CPU cores", request.cpu_cores)?;
        let static_ip =
            StaticIp::parse(request.static_ipv4.as_deref(), request.static_ipv6.as_deref())?;
        Ok(Provision {
            owner_id: request.owner_id,
            ram,
            cpu,
            storage: request.storage_gb.unwrap_or(self.config.default_storage_gb),
            static_ip,
            plan: request.plan,
            processor: request.processor,
        })
    }

    async fn reserve_id(&self, owner: &str) -> Reservation<'_> {
        let store = self.store.read().await;
        let mut reserved = self.reserved.lock();
        let id = store.next_container_id(owner, &reserved);
        reserved.insert(id.clone());
        Reservation { reserved: &self.reserved, id }
    }

    fn enter(&self, container_id: &str, state: LifecycleState) -> InFlight<'_> {
        self.in_flight.lock().insert(container_id.to_string(), state);
        InFlight { states: &self.in_flight, id: container_id.to_string() }
    }

    async fn provision(&self, p: Provision) -> FleetResult<CreateOutcome> {
        let reservation = self.reserve_id(&p.owner_id).await;
        let container_id = reservation.id.clone();
        let _guard = self.locks.acquire(&container_id).await;
        let _state = self.enter(&container_id, LifecycleState::Provisioning);

        info!(container = %container_id, owner = %p.owner_id, ram_gb = p.ram, cpu = p.cpu, "creating VPS");
        let launch = self.cli.launch(&container_id, u64::from(p.ram) * 1024, p.cpu);
        self.invoke(launch, self.config.command_timeout()).await?;

        self.settle(self.config.launch_settle()).await;
        let mut addresses = self.addresses(&container_id).await;

        let mut warnings = Vec::new();
        if !p.static_ip.is_empty() {
            match self.apply_static_ip(&container_id, p.static_ip).await {
                Ok(()) => {
                    self.settle(self.config.static_ip_settle()).await;
                    addresses = self.addresses(&container_id).await;
                }
                Err(e) => {
                    warn!(container = %container_id, error = %e, "static IP failed, keeping dynamic addresses");
                    warnings.push(Warning::StaticIpFallback { reason: e.to_string() });
                }
            }
        }

        let mut record = VpsRecord::new(container_id.clone(), p.owner_id, p.ram, p.cpu, p.storage);
        record.ipv4 = addresses.ipv4;
        record.ipv6 = addresses.ipv6;
        record.plan = p.plan;
        record.processor = p.processor;

        let vps_number = self.store.write().await.insert(record.clone())?;
        drop(reservation);

        info!(
            container = %container_id,
            vps_number,
            ipv4 = %record.ipv4,
            ipv6 = %record.ipv6,
            "VPS created"
        );
        Ok(CreateOutcome { record, vps_number, warnings })
    }

    // ─── Power ───────────────────────────────────────────────────────────

    pub async fn start(&self, cap: Capability, container_id: &str) -> FleetResult<VpsRecord> {
        authorize(cap, Access::Operator, "start a VPS")?;
        let argv = self.cli.start(container_id);
        self.transition(container_id, argv, self.config.command_timeout(), VpsStatus::Running)
            .await
    }

    pub async fn stop(&self, cap: Capability, container_id: &str) -> FleetResult<VpsRecord> {
        authorize(cap, Access::Operator, "stop a VPS")?;
        let argv = self.cli.stop(container_id);
        self.transition(container_id, argv, self.config.shutdown_timeout(), VpsStatus::Stopped)
            .await
    }

    /// Restart a container; its record, if any, is marked running.
    pub async fn restart(&self, cap: Capability, container_id: &str) -> FleetResult<Option<VpsRecord>> {
        authorize(cap, Access::Admin, "restart a VPS")?;
        validate_name("container id", container_id)?;
        let _guard = self.locks.acquire(container_id).await;

        self.invoke(self.cli.restart(container_id), self.config.command_timeout()).await?;
        let record = self.store.write().await.update(container_id, |r| {
            r.status = VpsStatus::Running;
            r.clone()
        })?;
        info!(container = %container_id, tracked = record.is_some(), "VPS restarted");
        Ok(record)
    }

    async fn transition(
        &self,
        container_id: &str,
        argv: Vec<String>,
        timeout: Duration,
        status: VpsStatus,
    ) -> FleetResult<VpsRecord> {
        validate_name("container id", container_id)?;
        let _guard = self.locks.acquire(container_id).await;
        self.require_record(container_id).await?;

        self.invoke(argv, timeout).await?;
        let record = self.update_record(container_id, |r| r.status = status).await?;
        info!(container = %container_id, %status, "VPS status changed");
        Ok(record)
    }

    // ─── Reinstall & Delete ──────────────────────────────────────────────

    /// Destroy and relaunch with the same resources. Not atomic: a failed
    /// relaunch leaves the record pointing at a missing container.
    pub async fn reinstall(&self, cap: Capability, container_id: &str) -> FleetResult<VpsRecord> {
        authorize(cap, Access::Owner, "reinstall a VPS")?;
        validate_name("container id", container_id)?;
        let _guard = self.locks.acquire(container_id).await;
        let record = self.require_record(container_id).await?;
        let _state = self.enter(container_id, LifecycleState::Reinstalling);

        warn!(container = %container_id, "reinstalling VPS, existing container will be destroyed");
        self.invoke(self.cli.delete_force(container_id), self.config.command_timeout()).await?;

        let launch = self.cli.launch(container_id, record.ram_mb(), record.cpu);
        let command = display_command(&launch);
        if let Err(source) = self.runner.run(&command, self.config.command_timeout()).await {
            error!(container = %container_id, error = %source, "relaunch failed after delete");
            return Err(FleetError::ReinstallIncomplete {
                container_id: container_id.to_string(),
                source,
            });
        }

        self.settle(self.config.launch_settle()).await;
        let addresses = self.addresses(container_id).await;
        let record = self
            .update_record(container_id, |r| {
                r.status = VpsStatus::Running;
                r.created_at = Utc::now();
                r.ipv4 = addresses.ipv4;
                r.ipv6 = addresses.ipv6;
            })
            .await?;
        info!(container = %container_id, ipv4 = %record.ipv4, ipv6 = %record.ipv6, "VPS reinstalled");
        Ok(record)
    }

    pub async fn delete(&self, cap: Capability, container_id: &str) -> FleetResult<VpsRecord> {
        authorize(cap, Access::Admin, "delete a VPS")?;
        validate_name("container id", container_id)?;
        let guard = self.locks.acquire(container_id).await;
        self.require_record(container_id).await?;

        self.invoke(self.cli.delete_force(container_id), self.config.command_timeout()).await?;
        let removed = self
            .store
            .write()
            .await
            .remove(container_id)?
            .ok_or_else(|| not_found(container_id))?;

        drop(guard);
        self.locks.prune();
        warn!(container = %container_id, owner = %removed.owner_id, "VPS deleted");
        Ok(removed)
    }

    // ─── Networking ──────────────────────────────────────────────────────

    pub async fn set_static_ip(
        &self,
        cap: Capability,
        container_id: &str,
        ipv4: Option<&str>,
        ipv6: Option<&str>,
    ) -> FleetResult<VpsRecord> {
        authorize(cap, Access::Admin, "set a static IP")?;
        validate_name("container id", container_id)?;
        let ip = StaticIp::parse(ipv4, ipv6)?;
        if ip.is_empty() {
            return Err(FleetError::Validation("at least one address is required".into()));
        }
        let _guard = self.locks.acquire(container_id).await;
        self.require_record(container_id).await?;

        self.apply_static_ip(container_id, ip).await?;
        let record = self
            .update_record(container_id, |r| {
                if let Some(v4) = ip.ipv4 {
                    r.ipv4 = v4.to_string();
                }
                if let Some(v6) = ip.ipv6 {
                    r.ipv6 = v6.to_string();
                }
                r.status = VpsStatus::Running;
            })
            .await?;
        info!(container = %container_id, ipv4 = %record.ipv4, ipv6 = %record.ipv6, "static IP set");
        Ok(record)
    }

    async fn apply_static_ip(&self, container_id: &str, ip: StaticIp) -> FleetResult<()> {
        let timeout = self.config.command_timeout();
        if let Some(v4) = ip.ipv4 {
            let argv = self.cli.device_set(container_id, "ipv4.address", &v4.to_string());
            self.invoke(argv, timeout).await?;
        }
        if let Some(v6) = ip.ipv6 {
            let argv = self.cli.device_set(container_id, "ipv6.address", &v6.to_string());
            self.invoke(argv, timeout).await?;
        }
        self.invoke(self.cli.restart(container_id), timeout).await?;
        Ok(())
    }

    async fn addresses(&self, container_id: &str) -> Addresses {
        get_addresses(self.runner.as_ref(), &self.cli.bin, &self.cli.interface, container_id).await
    }

    // ─── Sharing ─────────────────────────────────────────────────────────

    pub async fn share(&self, cap: Capability, container_id: &str, tenant: &str) -> FleetResult<VpsRecord> {
        authorize(cap, Access::Owner, "share a VPS")?;
        if tenant.trim().is_empty() {
            return Err(FleetError::Validation("tenant id must not be empty".into()));
        }
        let _guard = self.locks.acquire(container_id).await;
        let mut store = self.store.write().await;

        let record = store.find(container_id).ok_or_else(|| not_found(container_id))?;
        if record.owner_id == tenant {
            return Err(FleetError::Validation("a VPS cannot be shared with its owner".into()));
        }
        if record.shared_with.contains(tenant) {
            return Err(FleetError::Validation(format!(
                "tenant '{tenant}' already has access to '{container_id}'"
            )));
        }

        let record = store
            .update(container_id, |r| {
                r.shared_with.insert(tenant.to_string());
                r.clone()
            })?
            .ok_or_else(|| not_found(container_id))?;
        info!(container = %container_id, tenant = %tenant, "VPS shared");
        Ok(record)
    }

    pub async fn revoke(&self, cap: Capability, container_id: &str, tenant: &str) -> FleetResult<VpsRecord> {
        authorize(cap, Access::Owner, "revoke VPS access")?;
        let _guard = self.locks.acquire(container_id).await;
        let mut store = self.store.write().await;

        let record = store.find(container_id).ok_or_else(|| not_found(container_id))?;
        if !record.shared_with.contains(tenant) {
            return Err(FleetError::NotFound(format!(
                "tenant '{tenant}' has no shared access to '{container_id}'"
            )));
        }

        let record = store
            .update(container_id, |r| {
                r.shared_with.remove(tenant);
                r.clone()
            })?
            .ok_or_else(|| not_found(container_id))?;
        info!(container = %container_id, tenant = %tenant, "VPS access revoked");
        Ok(record)
    }

    // ─── Snapshots ───────────────────────────────────────────────────────

    pub async fn snapshot(&self, cap: Capability, container_id: &str) -> FleetResult<String> {
        authorize(cap, Access::Admin, "snapshot a VPS")?;
        validate_name("container id", container_id)?;
        let _guard = self.locks.acquire(container_id).await;

        let name = snapshot_name(container_id, Utc::now());
        self.invoke(self.cli.snapshot(container_id, &name), self.config.command_timeout()).await?;
        info!(container = %container_id, snapshot = %name, "snapshot created");
        Ok(name)
    }

    pub async fn list_snapshots(&self, cap: Capability, container_id: &str) -> FleetResult<Vec<String>> {
        authorize(cap, Access::Admin, "list snapshots")?;
        validate_name("container id", container_id)?;
        let _guard = self.locks.acquire(container_id).await;

        let output = self.invoke(self.cli.info(container_id), QUICK_TIMEOUT).await?;
        Ok(parse_snapshots(output.text()))
    }

    pub async fn restore(&self, cap: Capability, container_id: &str, snapshot: &str) -> FleetResult<()> {
        authorize(cap, Access::Admin, "restore a snapshot")?;
        validate_name("container id", container_id)?;
        validate_name("snapshot name", snapshot)?;
        let _guard = self.locks.acquire(container_id).await;

        self.invoke(self.cli.restore(container_id, snapshot), self.config.command_timeout())
            .await?;
        info!(container = %container_id, snapshot = %snapshot, "snapshot restored");
        Ok(())
    }

    // ─── Exec ────────────────────────────────────────────────────────────

    /// Run a shell command in the container. A non-zero exit is reported in
    /// the output, not as an error.
    pub async fn exec(&self, cap: Capability, container_id: &str, command: &str) -> FleetResult<ExecOutput> {
        authorize(cap, Access::Admin, "execute commands")?;
        validate_name("container id", container_id)?;
        if command.trim().is_empty() {
            return Err(FleetError::Validation("command must not be empty".into()));
        }
        let _guard = self.locks.acquire(container_id).await;

        let argv = self.cli.exec_shell(container_id, command);
        let command_line = display_command(&argv);
        let raw = match self.runner.capture(&argv, self.config.command_timeout()).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(container = %container_id, command = %command_line, error = %e, "command in VPS did not complete");
                return Err(e.into());
            }
        };

        let output = ExecOutput::from_raw(raw);
        if output.exit_code == 0 {
            info!(
                container = %container_id,
                command = %command_line,
                code = output.exit_code,
                stdout = %output.stdout,
                stderr = %output.stderr,
                "command executed in VPS"
            );
        } else {
            error!(
                container = %container_id,
                command = %command_line,
                code = output.exit_code,
                stdout = %output.stdout,
                stderr = %output.stderr,
                "command in VPS exited non-zero"
            );
        }
        Ok(output)
    }

    // ─── SSH ─────────────────────────────────────────────────────────────

    /// Start a detached tmate session in the container and return its
    /// `ssh ...` connection command. tmate is installed on first use.
    pub async fn ssh_session(&self, cap: Capability, container_id: &str) -> FleetResult<SshSession> {
        authorize(cap, Access::Operator, "open an SSH session")?;
        validate_name("container id", container_id)?;
        let _guard = self.locks.acquire(container_id).await;
        self.require_record(container_id).await?;
        let timeout = self.config.command_timeout();

        let which = self.runner.capture(&self.cli.tmate_installed(container_id), QUICK_TIMEOUT).await?;
        if !which.success() {
            info!(container = %container_id, "tmate missing, installing");
            for step in self.cli.tmate_install(container_id) {
                self.invoke(step, timeout).await?;
            }
        }

        let session = session_name(Utc::now());
        let socket = format!("/tmp/{session}.sock");
        self.invoke(self.cli.tmate_start(container_id, &socket), timeout).await?;
        self.settle(self.config.ssh_settle()).await;

        let output = self.invoke(self.cli.tmate_ssh(container_id, &socket), QUICK_TIMEOUT).await?;
        let command = parse_ssh_command(output.text()).ok_or_else(|| FleetError::SshUnavailable {
            container_id: container_id.to_string(),
        })?;
        info!(container = %container_id, session = %session, "SSH session opened");
        Ok(SshSession { session, command })
    }

    // ─── Fleet-wide ──────────────────────────────────────────────────────

    pub async fn force_stop_all(&self, cap: Capability) -> FleetResult<usize> {
        authorize(cap, Access::Admin, "stop every VPS")?;
        self.stop_all("operator request").await
    }

    /// Host-wide forced stop. Takes no per-container locks.
    pub(crate) async fn stop_all(&self, reason: &str) -> FleetResult<usize> {
        warn!(reason = %reason, "force stopping all containers");
        self.invoke(self.cli.stop_all_force(), self.config.shutdown_timeout()).await?;
        let stopped = self.store.write().await.mark_all_stopped()?;
        warn!(stopped, "all containers force stopped");
        Ok(stopped)
    }

    // ─── Helpers ─────────────────────────────────────────────────────────

    async fn invoke(&self, argv: Vec<String>, timeout: Duration) -> FleetResult<CommandOutput> {
        let command = display_command(&argv);
        Ok(self.runner.run(&command, timeout).await?)
    }

    async fn settle(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn require_record(&self, container_id: &str) -> FleetResult<VpsRecord> {
        self.store.read().await.find(container_id).cloned().ok_or_else(|| not_found(container_id))
    }

    async fn update_record(
        &self,
        container_id: &str,
        f: impl FnOnce(&mut VpsRecord),
    ) -> FleetResult<VpsRecord> {
        self.store
            .write()
            .await
            .update(container_id, |r| {
                f(r);
                r.clone()
            })?
            .ok_or_else(|| not_found(container_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use chrono::TimeZone;
    use fleet_proto::container_id_for;
    use fleet_runner::{EMPTY_STDERR, ExecError};
    use tempfile::TempDir;

    const IP_OUTPUT: &str = "\
2: eth0@if7: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500
    inet 10.0.0.5/24 brd 10.0.0.255 scope global dynamic eth0
    inet6 fd42::5/64 scope global dynamic";

    struct Harness {
        _dir: TempDir,
        runner: Arc<ScriptedRunner>,
        manager: LifecycleManager,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RwLock::new(RecordStore::open(dir.path())));
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("ip addr show", 0, IP_OUTPUT, "");
        let config = LifecycleConfig {
            launch_settle_secs: 0,
            static_ip_settle_secs: 0,
            ssh_settle_secs: 0,
            ..LifecycleConfig::default()
        };
        let manager = LifecycleManager::new(Arc::clone(&runner) as Arc<dyn CommandRunner>, store, config);
        Harness { _dir: dir, runner, manager }
    }

    async fn seed(h: &Harness, owner: &str, seq: usize, status: VpsStatus) -> String {
        let id = container_id_for(owner, seq);
        let mut record = VpsRecord::new(id.clone(), owner.to_string(), 4, 1, 10);
        record.status = status;
        h.manager.store().write().await.insert(record).expect("insert");
        id
    }

    async fn record(h: &Harness, id: &str) -> Option<VpsRecord> {
        h.manager.store().read().await.find(id).cloned()
    }

    // ─── create ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_create_rejects_bad_input_without_runtime_calls() {
        let h = harness();
        for (ram, cpu) in [(0, 1), (4, 0), (-2, 1), (4, -1)] {
            let err = h
                .manager
                .create(Capability::Admin, CreateRequest::new("1", ram, cpu))
                .await
                .unwrap_err();
            assert!(matches!(err, FleetError::Validation(_)), "ram={ram} cpu={cpu}: {err}");
        }
        let bad_ip = CreateRequest::new("1", 4, 1).with_static_ip(Some("300.1.1.1".into()), None);
        let err = h.manager.create(Capability::Admin, bad_ip).await.unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));

        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_requires_admin() {
        let h = harness();
        let err = h
            .manager
            .create(Capability::Owner, CreateRequest::new("1", 4, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::PermissionDenied(_)));
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_launches_and_records() {
        let h = harness();
        let outcome = h
            .manager
            .create(Capability::Admin, CreateRequest::new("42", 4, 2))
            .await
            .expect("create");

        assert_eq!(outcome.vps_number, 1);
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.record.container_id, "vps-42-1");
        assert_eq!(outcome.record.ipv4, "10.0.0.5");
        assert_eq!(outcome.record.ipv6, "fd42::5");
        assert_eq!(outcome.record.storage, 10);

        let calls = h.runner.calls();
        assert_eq!(
            calls[0],
            "incus launch ubuntu:22.04 vps-42-1 --config limits.memory=4096MB --config limits.cpu=2 -s btrpool"
        );
        assert_eq!(calls[1], "incus exec vps-42-1 -- ip addr show eth0");
        assert_eq!(record(&h, "vps-42-1").await, Some(outcome.record));
        assert_eq!(h.manager.state_of("vps-42-1").await, LifecycleState::Running);

        let second = h
            .manager
            .create(Capability::Admin, CreateRequest::new("42", 8, 1))
            .await
            .expect("create");
        assert_eq!(second.record.container_id, "vps-42-2");
        assert_eq!(second.vps_number, 2);
    }

    #[tokio::test]
    async fn test_create_launch_failure_leaves_no_record() {
        let h = harness();
        h.runner.fail(" launch ", "Error: Storage pool not found");

        let err = h
            .manager
            .create(Capability::Admin, CreateRequest::new("1", 4, 1))
            .await
            .unwrap_err();
        match err {
            FleetError::Exec(ExecError::CommandFailed { stderr, .. }) => {
                assert!(stderr.contains("Storage pool"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(record(&h, "vps-1-1").await.is_none());
        assert!(h.manager.store().read().await.inventory().is_empty());
        assert!(h.manager.reserved.lock().is_empty());
        assert_eq!(h.manager.state_of("vps-1-1").await, LifecycleState::Deleted);
    }

    #[tokio::test]
    async fn test_create_skips_ids_left_by_deletions() {
        let h = harness();
        seed(&h, "1", 2, VpsStatus::Running).await;
        let outcome = h
            .manager
            .create(Capability::Admin, CreateRequest::new("1", 4, 1))
            .await
            .expect("create");
        assert_eq!(outcome.record.container_id, "vps-1-3");
        assert_eq!(outcome.vps_number, 2);
    }

    #[tokio::test]
    async fn test_create_static_ip_applied() {
        let h = harness();
        let request = CreateRequest::new("1", 4, 1).with_static_ip(Some("10.0.0.50".into()), None);
        let outcome = h.manager.create(Capability::Admin, request).await.expect("create");

        assert!(outcome.warnings.is_empty());
        assert_eq!(h.runner.calls_matching("config device set vps-1-1 eth0 ipv4.address=10.0.0.50"), 1);
        assert_eq!(h.runner.calls_matching("restart vps-1-1"), 1);
        assert_eq!(h.runner.calls_matching("ip addr show"), 2);
    }

    #[tokio::test]
    async fn test_create_static_ip_failure_falls_back() {
        let h = harness();
        h.runner.fail("ipv4.address", "Error: Device doesn't exist");
        let request = CreateRequest::new("1", 4, 1).with_static_ip(Some("10.0.0.50".into()), None);
        let outcome = h.manager.create(Capability::Admin, request).await.expect("create");

        assert_eq!(outcome.warnings.len(), 1);
        let Warning::StaticIpFallback { reason } = &outcome.warnings[0];
        assert!(reason.contains("Device doesn't exist"));
        assert_eq!(outcome.record.ipv4, "10.0.0.5");
        assert_eq!(h.runner.calls_matching("restart"), 0);
        assert!(record(&h, "vps-1-1").await.is_some());
    }

    #[tokio::test]
    async fn test_address_failure_records_error_sentinel() {
        let h = harness();
        let runner = Arc::new(ScriptedRunner::new());
        runner.time_out("ip addr show");
        let manager = LifecycleManager::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            Arc::clone(h.manager.store()),
            h.manager.config().clone(),
        );
        let outcome = manager
            .create(Capability::Admin, CreateRequest::new("1", 4, 1))
            .await
            .expect("create");
        assert_eq!(outcome.record.ipv4, fleet_proto::ADDRESS_ERROR);
        assert_eq!(outcome.record.ipv6, fleet_proto::ADDRESS_ERROR);
    }

    // ─── purchase ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_purchase_requires_credits() {
        let h = harness();
        let err = h.manager.purchase("5", "Starter", "Intel", None, None).await.unwrap_err();
        assert!(matches!(err, FleetError::InsufficientCredits { need: 42, have: 0 }));
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_purchase_charges_after_create() {
        let h = harness();
        h.manager.store().write().await.add_credits("5", 100).expect("credits");

        let bought = h.manager.purchase("5", "starter", "intel", None, None).await.expect("purchase");
        assert_eq!(bought.price, 42);
        assert_eq!(bought.balance, 58);
        assert_eq!(bought.created.record.plan.as_deref(), Some("Starter"));
        assert_eq!(bought.created.record.processor.as_deref(), Some("Intel"));
        assert_eq!(bought.created.record.ram, 4);
        assert_eq!(h.manager.store().read().await.credits("5"), 58);
    }

    #[tokio::test]
    async fn test_purchase_launch_failure_keeps_credits() {
        let h = harness();
        h.manager.store().write().await.add_credits("5", 100).expect("credits");
        h.runner.fail(" launch ", "quota exceeded");

        assert!(h.manager.purchase("5", "Starter", "AMD", None, None).await.is_err());
        assert_eq!(h.manager.store().read().await.credits("5"), 100);
    }

    #[tokio::test]
    async fn test_purchase_unknown_plan() {
        let h = harness();
        let err = h.manager.purchase("5", "Ultra", "Intel", None, None).await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
        let err = h.manager.purchase("5", "Pro", "ARM", None, None).await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
    }

    // ─── power ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_stop_and_start_flip_status() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;

        let stopped = h.manager.stop(Capability::Shared, &id).await.expect("stop");
        assert_eq!(stopped.status, VpsStatus::Stopped);
        assert_eq!(h.manager.state_of(&id).await, LifecycleState::Stopped);

        let started = h.manager.start(Capability::Owner, &id).await.expect("start");
        assert_eq!(started.status, VpsStatus::Running);
        assert_eq!(h.runner.calls(), vec!["incus stop vps-1-1", "incus start vps-1-1"]);
    }

    #[tokio::test]
    async fn test_stop_failure_leaves_record() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;
        h.runner.fail("stop vps-1-1", "");

        let err = h.manager.stop(Capability::Admin, &id).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(EMPTY_STDERR));
        assert!(msg.contains("incus stop vps-1-1"));
        assert_eq!(record(&h, &id).await.map(|r| r.status), Some(VpsStatus::Running));
    }

    #[tokio::test]
    async fn test_stop_timeout_is_an_error() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;
        h.runner.time_out("stop vps-1-1");

        let err = h.manager.stop(Capability::Admin, &id).await.unwrap_err();
        assert!(matches!(err, FleetError::Exec(ExecError::Timeout { secs: 120, .. })));
        assert_eq!(record(&h, &id).await.map(|r| r.status), Some(VpsStatus::Running));
    }

    #[tokio::test]
    async fn test_start_unknown_container() {
        let h = harness();
        let err = h.manager.start(Capability::Admin, "vps-9-9").await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_restart_marks_running() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Stopped).await;
        assert!(matches!(
            h.manager.restart(Capability::Owner, &id).await,
            Err(FleetError::PermissionDenied(_))
        ));
        let record = h.manager.restart(Capability::Admin, &id).await.expect("restart");
        assert_eq!(record.map(|r| r.status), Some(VpsStatus::Running));
    }

    // ─── reinstall ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_reinstall_owner_only() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;
        for cap in [Capability::Admin, Capability::Shared, Capability::SuperAdmin] {
            let err = h.manager.reinstall(cap, &id).await.unwrap_err();
            assert!(matches!(err, FleetError::PermissionDenied(_)));
        }
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reinstall_relaunches_with_record_resources() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Stopped).await;
        let before = record(&h, &id).await.expect("record").created_at;

        let record = h.manager.reinstall(Capability::Owner, &id).await.expect("reinstall");
        assert_eq!(record.status, VpsStatus::Running);
        assert!(record.created_at >= before);
        assert_eq!(
            h.runner.calls(),
            vec![
                "incus delete vps-1-1 --force",
                "incus launch ubuntu:22.04 vps-1-1 --config limits.memory=4096MB --config limits.cpu=1 -s btrpool",
                "incus exec vps-1-1 -- ip addr show eth0",
            ]
        );
    }

    #[tokio::test]
    async fn test_reinstall_refreshes_addresses() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;
        h.manager
            .store()
            .write()
            .await
            .update(&id, |r| {
                r.ipv4 = "10.0.0.99".into();
                r.ipv6 = "fd42::99".into();
            })
            .expect("stale addresses");

        let reinstalled = h.manager.reinstall(Capability::Owner, &id).await.expect("reinstall");
        assert_eq!(reinstalled.ipv4, "10.0.0.5");
        assert_eq!(reinstalled.ipv6, "fd42::5");
        let stored = record(&h, &id).await.expect("record");
        assert_eq!((stored.ipv4.as_str(), stored.ipv6.as_str()), ("10.0.0.5", "fd42::5"));
    }

    #[tokio::test]
    async fn test_reinstall_relaunch_failure_is_incomplete() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;
        h.runner.fail(" launch ", "Error: image not found");

        let err = h.manager.reinstall(Capability::Owner, &id).await.unwrap_err();
        match &err {
            FleetError::ReinstallIncomplete { container_id, .. } => assert_eq!(container_id, &id),
            other => panic!("unexpected error: {other}"),
        }
        assert!(record(&h, &id).await.is_some());
        assert_eq!(h.manager.state_of(&id).await, LifecycleState::Running);
    }

    #[tokio::test]
    async fn test_reinstall_delete_failure_propagates() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;
        h.runner.fail("delete", "busy");

        let err = h.manager.reinstall(Capability::Owner, &id).await.unwrap_err();
        assert!(matches!(err, FleetError::Exec(_)));
        assert_eq!(h.runner.calls_matching("launch"), 0);
    }

    // ─── delete ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_delete_twice_is_not_found() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;

        let removed = h.manager.delete(Capability::Admin, &id).await.expect("delete");
        assert_eq!(removed.container_id, id);
        assert!(h.manager.locks().is_empty());
        let err = h.manager.delete(Capability::Admin, &id).await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));

        assert_eq!(h.runner.calls_matching("delete"), 1);
        assert!(!h.manager.store().read().await.inventory().contains_key("1"));
        assert_eq!(h.manager.state_of(&id).await, LifecycleState::Deleted);
    }

    #[tokio::test]
    async fn test_delete_shifts_numbers() {
        let h = harness();
        let first = seed(&h, "1", 1, VpsStatus::Running).await;
        let second = seed(&h, "1", 2, VpsStatus::Running).await;

        h.manager.delete(Capability::SuperAdmin, &first).await.expect("delete");
        let store = h.manager.store().read().await;
        let location = store.locate(&second).expect("still present");
        assert_eq!(location.number, 1);
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_record() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;
        h.runner.fail("delete", "Error: not allowed");

        assert!(h.manager.delete(Capability::Admin, &id).await.is_err());
        assert!(record(&h, &id).await.is_some());
    }

    // ─── networking ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_set_static_ip_updates_record() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;

        let err = h.manager.set_static_ip(Capability::Admin, &id, None, Some(" ")).await.unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));

        let record = h
            .manager
            .set_static_ip(Capability::Admin, &id, Some("10.0.0.77"), Some("fd42::77"))
            .await
            .expect("set ip");
        assert_eq!(record.ipv4, "10.0.0.77");
        assert_eq!(record.ipv6, "fd42::77");
        assert_eq!(h.runner.calls_matching("config device set"), 2);
    }

    // ─── sharing ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_share_and_revoke() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;

        let shared = h.manager.share(Capability::Owner, &id, "7").await.expect("share");
        assert!(shared.shared_with.contains("7"));

        let dup = h.manager.share(Capability::Owner, &id, "7").await.unwrap_err();
        assert!(matches!(dup, FleetError::Validation(_)));
        let own = h.manager.share(Capability::Owner, &id, "1").await.unwrap_err();
        assert!(matches!(own, FleetError::Validation(_)));
        let denied = h.manager.share(Capability::Shared, &id, "8").await.unwrap_err();
        assert!(matches!(denied, FleetError::PermissionDenied(_)));

        let missing = h.manager.revoke(Capability::Owner, &id, "8").await.unwrap_err();
        assert!(matches!(missing, FleetError::NotFound(_)));
        let revoked = h.manager.revoke(Capability::Owner, &id, "7").await.expect("revoke");
        assert!(revoked.shared_with.is_empty());
        assert!(h.runner.calls().is_empty());
    }

    // ─── snapshots ───────────────────────────────────────────────────────

    #[test]
    fn test_snapshot_name_format() {
        let at = Utc.with_ymd_and_hms(2025, 10, 20, 13, 25, 44).unwrap();
        assert_eq!(snapshot_name("vps-1-1", at), "vps-1-1-backup-20251020-132544");
    }

    #[tokio::test]
    async fn test_snapshot_list_restore() {
        let h = harness();
        h.runner.respond(
            "info vps-1-1",
            0,
            "Name: vps-1-1\nSnapshots:\n  vps-1-1-backup-20251020-132544 (taken at 2025/10/20 13:25 UTC) (stateless)\n",
            "",
        );

        let name = h.manager.snapshot(Capability::Admin, "vps-1-1").await.expect("snapshot");
        assert!(name.starts_with("vps-1-1-backup-"));
        assert_eq!(h.runner.calls_matching(&format!("incus snapshot vps-1-1 {name}")), 1);

        let snaps = h.manager.list_snapshots(Capability::Admin, "vps-1-1").await.expect("list");
        assert_eq!(snaps, vec!["vps-1-1-backup-20251020-132544"]);

        h.manager
            .restore(Capability::Admin, "vps-1-1", &snaps[0])
            .await
            .expect("restore");
        assert_eq!(
            h.runner.calls_matching("incus restore vps-1-1 vps-1-1-backup-20251020-132544"),
            1
        );

        let bad = h.manager.restore(Capability::Admin, "vps-1-1", "--force").await.unwrap_err();
        assert!(matches!(bad, FleetError::Validation(_)));
        let denied = h.manager.snapshot(Capability::Owner, "vps-1-1").await.unwrap_err();
        assert!(matches!(denied, FleetError::PermissionDenied(_)));
    }

    // ─── exec ────────────────────────────────────────────────────────────

    #[test]
    fn test_truncate_output() {
        let (short, cut) = truncate_output("hello");
        assert_eq!(short, "hello");
        assert!(!cut);

        let long = "é".repeat(OUTPUT_LIMIT + 1);
        let (text, cut) = truncate_output(&long);
        assert!(cut);
        assert!(text.ends_with(TRUNCATION_MARKER));
        assert_eq!(text.chars().count(), OUTPUT_LIMIT + TRUNCATION_MARKER.chars().count());

        let exact = "a".repeat(OUTPUT_LIMIT);
        assert_eq!(truncate_output(&exact), (exact.clone(), false));
    }

    #[tokio::test]
    async fn test_exec_truncates_and_reports_exit_code() {
        let h = harness();
        h.runner.respond("bash -c", 0, &"a".repeat(1500), "");

        let out = h.manager.exec(Capability::Admin, "vps-1-1", "yes a | head -c 1500").await.expect("exec");
        assert!(out.truncated);
        assert_eq!(out.stdout.len(), OUTPUT_LIMIT + TRUNCATION_MARKER.len());
        assert_eq!(out.stderr, "");
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn test_exec_nonzero_exit_is_output() {
        let h = harness();
        h.runner.respond("bash -c", 3, "", "");
        let out = h.manager.exec(Capability::Admin, "vps-1-1", "exit 3").await.expect("exec");
        assert_eq!(out.exit_code, 3);
        assert!(!out.truncated);
        assert_eq!(h.runner.calls(), vec!["incus exec vps-1-1 -- bash -c exit 3"]);
    }

    /// Collects formatted log lines for assertions.
    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogCapture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_exec_logs_command_and_truncated_streams() {
        let logs = LogCapture::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let h = harness();
        h.runner.respond("bash -c", 2, "partial", &"e".repeat(1500));
        let out = h.manager.exec(Capability::Admin, "vps-1-1", "uptime").await.expect("exec");
        assert_eq!(out.exit_code, 2);

        let text = logs.text();
        assert!(text.contains("command in VPS exited non-zero"), "{text}");
        assert!(text.contains("incus exec vps-1-1 -- bash -c uptime"));
        assert!(text.contains("partial"));
        assert!(text.contains("(truncated)"));
        assert!(!text.contains(&"e".repeat(OUTPUT_LIMIT + 1)));
    }

    // ─── ssh ─────────────────────────────────────────────────────────────

    const TMATE_SSH: &str = "ssh Kx7pQ2mN9vLr@nyc1.tmate.io\n";

    #[tokio::test]
    async fn test_ssh_session_with_tmate_present() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;
        h.runner.respond("display -p", 0, TMATE_SSH, "");

        let ssh = h.manager.ssh_session(Capability::Shared, &id).await.expect("ssh");
        assert_eq!(ssh.command, "ssh Kx7pQ2mN9vLr@nyc1.tmate.io");
        assert!(ssh.session.starts_with("session-"));

        let socket = format!("/tmp/{}.sock", ssh.session);
        assert_eq!(
            h.runner.calls(),
            vec![
                "incus exec vps-1-1 -- which tmate".to_string(),
                format!("incus exec vps-1-1 -- tmate -S {socket} new-session -d"),
                format!("incus exec vps-1-1 -- tmate -S {socket} display -p #{{tmate_ssh}}"),
            ]
        );
    }

    #[tokio::test]
    async fn test_ssh_session_installs_missing_tmate() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;
        h.runner
            .respond("which tmate", 1, "", "")
            .respond("display -p", 0, TMATE_SSH, "");

        h.manager.ssh_session(Capability::Owner, &id).await.expect("ssh");
        let calls = h.runner.calls();
        let install = calls.iter().position(|c| c.contains("apt-get install tmate")).expect("install");
        let start = calls.iter().position(|c| c.contains("new-session -d")).expect("start");
        assert!(install < start);
        assert_eq!(h.runner.calls_matching("apt-get update"), 1);
    }

    #[tokio::test]
    async fn test_ssh_session_install_failure_propagates() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;
        h.runner.respond("which tmate", 1, "", "").fail("apt-get install", "E: Unable to locate package");

        let err = h.manager.ssh_session(Capability::Owner, &id).await.unwrap_err();
        assert!(matches!(err, FleetError::Exec(_)));
        assert_eq!(h.runner.calls_matching("new-session"), 0);
    }

    #[tokio::test]
    async fn test_ssh_session_without_url() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;

        let err = h.manager.ssh_session(Capability::Admin, &id).await.unwrap_err();
        assert!(matches!(err, FleetError::SshUnavailable { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_ssh_session_unknown_container() {
        let h = harness();
        let err = h.manager.ssh_session(Capability::Admin, "vps-9-9").await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
        assert!(h.runner.calls().is_empty());
    }

    #[test]
    fn test_parse_ssh_command() {
        assert_eq!(
            parse_ssh_command("\n  ssh abc@lon1.tmate.io  \n").as_deref(),
            Some("ssh abc@lon1.tmate.io")
        );
        assert_eq!(parse_ssh_command("tmate is starting"), None);
        assert_eq!(parse_ssh_command(""), None);
    }

    // ─── fleet-wide ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_force_stop_all_flips_running() {
        let h = harness();
        seed(&h, "1", 1, VpsStatus::Running).await;
        seed(&h, "1", 2, VpsStatus::Stopped).await;
        seed(&h, "2", 1, VpsStatus::Running).await;

        let denied = h.manager.force_stop_all(Capability::Owner).await.unwrap_err();
        assert!(matches!(denied, FleetError::PermissionDenied(_)));

        let stopped = h.manager.force_stop_all(Capability::Admin).await.expect("stop all");
        assert_eq!(stopped, 2);
        assert_eq!(h.manager.store().read().await.stats().running_vps, 0);
        assert_eq!(h.runner.calls(), vec!["incus stop --all --force"]);
    }

    #[tokio::test]
    async fn test_force_stop_all_failure_keeps_statuses() {
        let h = harness();
        seed(&h, "1", 1, VpsStatus::Running).await;
        h.runner.fail("stop --all", "boom");

        assert!(h.manager.force_stop_all(Capability::Admin).await.is_err());
        assert_eq!(h.manager.store().read().await.stats().running_vps, 1);
    }

    #[tokio::test]
    async fn test_state_of_in_flight() {
        let h = harness();
        let id = seed(&h, "1", 1, VpsStatus::Running).await;
        {
            let _state = h.manager.enter(&id, LifecycleState::Reinstalling);
            assert_eq!(h.manager.state_of(&id).await, LifecycleState::Reinstalling);
        }
        assert_eq!(h.manager.state_of(&id).await, LifecycleState::Running);
    }
}
