//! In-memory host bindings and a node harness for agent tests.

use std::{
    collections::{HashMap, HashSet},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tempfile::TempDir;
use url::Url;

use crate::{
    agent::{
        Agent, AgentConfig, HostBindings,
        disk::{BlockDevice, DiskTool},
        error::{self, AgentError},
        image::{Image, ImageAgentConfig},
        machine::{
            MachineAgentConfig, migration_file,
            container::runtime::{ContainerRuntime, ContainerStatus},
            hypervisor::monitor::{ControlChannel, ControlSession},
            machine::{BackendKind, MachineDescriptor, MachineSpec},
            watchdog::{Alert, Notifier},
        },
        migration::{
            MigrationAgentConfig,
            remote::{Remote, RemoteClient, RemoteConfig, RemoteConnector, Transfer},
        },
        net::{NetAgentConfig, device::DeviceControl, filter::TrafficFilter, stats::PacketCounters},
        storage::{StorageBackend, machine_dir},
    },
    constants::{ARCHIVE_EXTENSION, DISK_FILE},
    utils::archive,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeTap {
    pub persistent: bool,
    pub bridge: Option<String>,
}

#[derive(Default)]
pub struct FakeDevices {
    bridges: Mutex<HashSet<String>>,
    taps: Mutex<HashMap<String, FakeTap>>,
}

impl FakeDevices {
    pub fn with_bridge(bridge: &str) -> Self {
        let devices = Self::default();
        devices.bridges.lock().unwrap().insert(bridge.to_string());
        devices
    }

    pub fn tap(&self, name: &str) -> Option<FakeTap> {
        self.taps.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl DeviceControl for FakeDevices {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.bridges.lock().unwrap().contains(name)
            || self.taps.lock().unwrap().contains_key(name))
    }

    async fn create_tap(&self, name: &str) -> Result<()> {
        self.taps
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .persistent = true;
        Ok(())
    }

    async fn attach_to_bridge(&self, name: &str, bridge: &str) -> Result<()> {
        if !self.bridges.lock().unwrap().contains(bridge) {
            bail!("no bridge {bridge}");
        }
        let mut taps = self.taps.lock().unwrap();
        let Some(tap) = taps.get_mut(name) else {
            bail!("no device {name}");
        };
        tap.bridge = Some(bridge.to_string());
        Ok(())
    }

    async fn release_tap(&self, name: &str) -> Result<()> {
        let mut taps = self.taps.lock().unwrap();
        let Some(tap) = taps.get_mut(name) else {
            bail!("no device {name}");
        };
        tap.persistent = false;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if self.taps.lock().unwrap().remove(name).is_none() {
            bail!("no device {name}");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFilter {
    chain: AtomicBool,
    rules: Mutex<HashSet<(String, String)>>,
    fail_grants: AtomicBool,
    fail_revokes: AtomicBool,
}

impl FakeFilter {
    pub fn chain_ready(&self) -> bool {
        self.chain.load(Ordering::SeqCst)
    }

    pub fn rules(&self) -> HashSet<(String, String)> {
        self.rules.lock().unwrap().clone()
    }

    pub fn has(&self, mac: &str, ip: &str) -> bool {
        self.rules
            .lock()
            .unwrap()
            .contains(&(mac.to_string(), ip.to_string()))
    }

    pub fn remove(&self, mac: &str, ip: &str) {
        self.rules
            .lock()
            .unwrap()
            .remove(&(mac.to_string(), ip.to_string()));
    }

    pub fn fail_grants(&self, fail: bool) {
        self.fail_grants.store(fail, Ordering::SeqCst);
    }

    pub fn fail_revokes(&self, fail: bool) {
        self.fail_revokes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TrafficFilter for FakeFilter {
    async fn ensure_chain(&self) -> Result<()> {
        self.chain.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn grant(&self, mac: &str, ip: &str) -> Result<()> {
        if self.fail_grants.load(Ordering::SeqCst) {
            bail!("grant refused");
        }
        self.rules
            .lock()
            .unwrap()
            .insert((mac.to_string(), ip.to_string()));
        Ok(())
    }

    async fn revoke(&self, mac: &str, ip: &str) -> Result<()> {
        if self.fail_revokes.load(Ordering::SeqCst) {
            bail!("revoke refused");
        }
        self.remove(mac, ip);
        Ok(())
    }

    async fn is_granted(&self, mac: &str, ip: &str) -> Result<bool> {
        Ok(self.has(mac, ip))
    }
}

/// Counters that grow by a fixed step on every read.
#[derive(Default)]
pub struct FakeCounters {
    devices: Mutex<HashMap<String, (u64, u64)>>,
}

impl FakeCounters {
    pub fn set_rate(&self, device: &str, step: u64) {
        self.devices
            .lock()
            .unwrap()
            .entry(device.to_string())
            .or_default()
            .1 = step;
    }
}

#[async_trait]
impl PacketCounters for FakeCounters {
    async fn tx_packets(&self, device: &str) -> Result<Option<u64>> {
        let mut devices = self.devices.lock().unwrap();
        Ok(devices.get_mut(device).map(|(count, step)| {
            *count += *step;
            *count
        }))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: &Alert) {
        self.alerts.lock().unwrap().push(alert.clone());
    }
}

#[derive(Default)]
struct QemuState {
    sizes: HashMap<PathBuf, u64>,
    backing: HashMap<PathBuf, PathBuf>,
    markers: HashMap<PathBuf, String>,
    rebases: usize,
    paused: HashSet<PathBuf>,
    fail_saves: bool,
}

/// Disk tool and control socket in one. Snapshots live inside the disk file as a JSON object
/// of name to guest marker, so they travel with the file.
#[derive(Clone, Default)]
pub struct FakeQemu {
    state: Arc<Mutex<QemuState>>,
}

impl FakeQemu {
    pub fn set_size(&self, disk: &Path, bytes: u64) {
        self.state
            .lock()
            .unwrap()
            .sizes
            .insert(disk.to_path_buf(), bytes);
    }

    pub fn backing_of(&self, disk: &Path) -> Option<PathBuf> {
        self.state.lock().unwrap().backing.get(disk).cloned()
    }

    pub fn rebases(&self) -> usize {
        self.state.lock().unwrap().rebases
    }

    /// Guest-visible state of the machine running on `disk`.
    pub fn set_guest_marker(&self, disk: &Path, value: &str) {
        self.state
            .lock()
            .unwrap()
            .markers
            .insert(disk.to_path_buf(), value.to_string());
    }

    pub fn guest_marker(&self, disk: &Path) -> Option<String> {
        self.state.lock().unwrap().markers.get(disk).cloned()
    }

    /// Whether the machine running on `disk` was stopped and not continued.
    pub fn paused(&self, disk: &Path) -> bool {
        self.state.lock().unwrap().paused.contains(disk)
    }

    /// Makes `savevm` fail the way a full disk does.
    pub fn fail_saves(&self, fail: bool) {
        self.state.lock().unwrap().fail_saves = fail;
    }

    fn read_snapshots(disk: &Path) -> Map<String, Value> {
        std::fs::read_to_string(disk)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn write_snapshots(disk: &Path, snapshots: &Map<String, Value>) -> Result<()> {
        std::fs::write(disk, serde_json::to_vec(snapshots)?)?;
        Ok(())
    }

    fn save(&self, disk: &Path, name: &str) -> Result<()> {
        if self.state.lock().unwrap().fail_saves {
            bail!("Error: Error while writing VM state: No space left on device");
        }
        let mut snapshots = Self::read_snapshots(disk);
        let marker = self.guest_marker(disk).map(Value::String).unwrap_or(Value::Null);
        snapshots.insert(name.to_string(), marker);
        Self::write_snapshots(disk, &snapshots)
    }

    fn load(&self, disk: &Path, name: &str) -> Result<()> {
        let snapshots = Self::read_snapshots(disk);
        let Some(marker) = snapshots.get(name) else {
            bail!("Error: Snapshot '{name}' does not exist");
        };

        let mut state = self.state.lock().unwrap();
        match marker.as_str() {
            Some(marker) => state.markers.insert(disk.to_path_buf(), marker.to_string()),
            None => state.markers.remove(disk),
        };
        Ok(())
    }

    fn remove(&self, disk: &Path, name: &str) -> Result<()> {
        let mut snapshots = Self::read_snapshots(disk);
        if snapshots.remove(name).is_none() {
            bail!("Error: Snapshot '{name}' does not exist");
        }
        Self::write_snapshots(disk, &snapshots)
    }
}

#[async_trait]
impl DiskTool for FakeQemu {
    async fn create_overlay(&self, disk: &Path, backing: &Path) -> Result<()> {
        std::fs::write(disk, b"{}")?;
        self.state
            .lock()
            .unwrap()
            .backing
            .insert(disk.to_path_buf(), backing.to_path_buf());
        Ok(())
    }

    async fn rebase(&self, disk: &Path, backing: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.rebases += 1;
        state.backing.insert(disk.to_path_buf(), backing.to_path_buf());
        Ok(())
    }

    async fn virtual_size(&self, disk: &Path) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .sizes
            .get(disk)
            .copied()
            .unwrap_or_default())
    }

    async fn resize(&self, disk: &Path, bytes: u64) -> Result<()> {
        self.set_size(disk, bytes);
        Ok(())
    }

    async fn snapshots(&self, disk: &Path) -> Result<Vec<String>> {
        Ok(Self::read_snapshots(disk).keys().cloned().collect())
    }

    async fn snapshot_create(&self, disk: &Path, name: &str) -> Result<()> {
        self.save(disk, name)
    }

    async fn snapshot_apply(&self, disk: &Path, name: &str) -> Result<()> {
        self.load(disk, name)
    }

    async fn snapshot_delete(&self, disk: &Path, name: &str) -> Result<()> {
        self.remove(disk, name)
    }
}

#[async_trait]
impl ControlChannel for FakeQemu {
    async fn open(&self, socket: &Path) -> Result<Box<dyn ControlSession>> {
        let Some(dir) = socket.parent() else {
            bail!("no machine directory for {}", socket.display());
        };

        Ok(Box::new(FakeQemuSession {
            qemu: self.clone(),
            disk: dir.join(DISK_FILE),
        }))
    }
}

struct FakeQemuSession {
    qemu: FakeQemu,
    disk: PathBuf,
}

#[async_trait]
impl ControlSession for FakeQemuSession {
    async fn execute(&mut self, command: &str) -> Result<Value> {
        match command {
            "stop" => {
                let mut state = self.qemu.state.lock().unwrap();
                state.paused.insert(self.disk.clone());
                Ok(json!({}))
            }
            "cont" => {
                let mut state = self.qemu.state.lock().unwrap();
                state.paused.remove(&self.disk);
                Ok(json!({}))
            }
            other => bail!("{other}: command not found"),
        }
    }

    async fn human_monitor(&mut self, command_line: &str) -> Result<String> {
        let Some((command, name)) = command_line.split_once(' ') else {
            bail!("{command_line}: Error: missing argument");
        };

        match command {
            "savevm" => self.qemu.save(&self.disk, name)?,
            "loadvm" => self.qemu.load(&self.disk, name)?,
            "delvm" => self.qemu.remove(&self.disk, name)?,
            other => bail!("{other}: Error: unknown command"),
        }
        Ok(String::new())
    }
}

/// Block slot whose partition is a map of relative path to file content. Mounting writes the
/// files out; unmounting reads them back and empties the mountpoint.
#[derive(Default)]
pub struct FakeBlock {
    active: AtomicUsize,
    attaches: AtomicUsize,
    detaches: AtomicUsize,
    overlapped: AtomicBool,
    fail_grow: AtomicBool,
    fail_unmount: AtomicBool,
    guest: Mutex<HashMap<PathBuf, String>>,
    mounted_at: Mutex<Option<PathBuf>>,
}

impl FakeBlock {
    pub fn attaches(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    pub fn detaches(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }

    /// Whether two disks were ever attached at the same time.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn fail_grow(&self, fail: bool) {
        self.fail_grow.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unmount(&self, fail: bool) {
        self.fail_unmount.store(fail, Ordering::SeqCst);
    }

    pub fn put_guest_file(&self, path: &str, content: &str) {
        self.guest
            .lock()
            .unwrap()
            .insert(PathBuf::from(path), content.to_string());
    }

    pub fn guest_file(&self, path: &str) -> Option<String> {
        self.guest.lock().unwrap().get(Path::new(path)).cloned()
    }

    /// Where the partition was last mounted.
    pub fn mounted_at(&self) -> Option<PathBuf> {
        self.mounted_at.lock().unwrap().clone()
    }
}

fn collect_files(root: &Path, dir: &Path, files: &mut HashMap<PathBuf, String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else {
            let relative = path.strip_prefix(root)?.to_path_buf();
            files.insert(relative, std::fs::read_to_string(&path)?);
        }
    }
    Ok(())
}

#[async_trait]
impl BlockDevice for FakeBlock {
    async fn attach(&self, _disk: &Path) -> Result<String> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.attaches.fetch_add(1, Ordering::SeqCst);
        Ok("/dev/nbd-fake".to_string())
    }

    async fn detach(&self, _device: &str) -> Result<()> {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.detaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn grow_partition(&self, _device: &str, _partition: u32) -> Result<()> {
        if self.fail_grow.load(Ordering::SeqCst) {
            bail!("resize2fs failed");
        }
        Ok(())
    }

    async fn mount(&self, _device: &str, _partition: u32, mountpoint: &Path) -> Result<()> {
        for (path, content) in self.guest.lock().unwrap().iter() {
            let target = mountpoint.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, content)?;
        }
        *self.mounted_at.lock().unwrap() = Some(mountpoint.to_path_buf());
        Ok(())
    }

    async fn unmount(&self, mountpoint: &Path) -> Result<()> {
        if self.fail_unmount.load(Ordering::SeqCst) {
            bail!("umount: {}: target is busy", mountpoint.display());
        }

        let mut files = HashMap::new();
        collect_files(mountpoint, mountpoint, &mut files)?;
        *self.guest.lock().unwrap() = files;

        for entry in std::fs::read_dir(mountpoint)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(path)?;
            } else {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct FakeContainer {
    status: ContainerStatus,
    marker: Option<String>,
    ticks: u64,
}

impl Default for FakeContainer {
    fn default() -> Self {
        Self {
            status: ContainerStatus::Stopped,
            marker: None,
            ticks: 0,
        }
    }
}

const CHECKPOINT_STATE_FILE: &str = "state";

/// What the password tool of a [`TestHost`] prints for any password.
pub const TEST_PASSWORD_HASH: &str = "$6$kiln$hashed";

/// Containers are entries in a map; their directories are real, under `root`.
pub struct FakeRuntime {
    root: PathBuf,
    containers: Mutex<HashMap<String, FakeContainer>>,
    fail_stops: AtomicBool,
}

impl FakeRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            containers: Mutex::new(HashMap::new()),
            fail_stops: AtomicBool::new(false),
        }
    }

    pub fn set_guest_marker(&self, name: &str, value: &str) {
        self.containers
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .marker = Some(value.to_string());
    }

    pub fn guest_marker(&self, name: &str) -> Option<String> {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .and_then(|c| c.marker.clone())
    }

    pub fn fail_stops(&self, fail: bool) {
        self.fail_stops.store(fail, Ordering::SeqCst);
    }

    fn set_status(&self, name: &str, status: ContainerStatus) {
        self.containers
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .status = status;
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn instantiate(&self, name: &str, _template: &Path) -> Result<()> {
        let dir = self.root.join(name);
        let rootfs = dir.join("rootfs");
        std::fs::create_dir_all(&rootfs)?;
        std::fs::write(
            dir.join("config"),
            format!(
                "lxc.rootfs.path = dir:{}\nlxc.uts.name = {}\n",
                rootfs.display(),
                name
            ),
        )?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.set_status(name, ContainerStatus::Running);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        if self.fail_stops.load(Ordering::SeqCst) {
            bail!("lxc-stop timed out");
        }
        self.set_status(name, ContainerStatus::Stopped);
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<ContainerStatus> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.status)
            .unwrap_or(ContainerStatus::Stopped))
    }

    async fn freeze(&self, name: &str) -> Result<()> {
        self.set_status(name, ContainerStatus::Frozen);
        Ok(())
    }

    async fn unfreeze(&self, name: &str) -> Result<()> {
        self.set_status(name, ContainerStatus::Running);
        Ok(())
    }

    async fn checkpoint(&self, name: &str, dir: &Path) -> Result<()> {
        let marker = self.guest_marker(name).unwrap_or_default();
        std::fs::write(dir.join(CHECKPOINT_STATE_FILE), marker)?;
        Ok(())
    }

    async fn restore(&self, name: &str, dir: &Path) -> Result<()> {
        let marker = std::fs::read_to_string(dir.join(CHECKPOINT_STATE_FILE))?;

        let mut containers = self.containers.lock().unwrap();
        let container = containers.entry(name.to_string()).or_default();
        container.marker = (!marker.is_empty()).then_some(marker);
        container.status = ContainerStatus::Running;
        Ok(())
    }

    async fn cpu_ticks(&self, name: &str) -> Result<u64> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers.entry(name.to_string()).or_default();
        container.ticks += 10;
        Ok(container.ticks)
    }

    async fn memory_usage(&self, _name: &str) -> Result<u64> {
        Ok(64 * 1024 * 1024)
    }
}

/// Connects every remote to one in-process peer agent.
#[derive(Default)]
pub struct FakeRemotes {
    peer: Mutex<Option<Arc<Agent>>>,
    fail_starts: Arc<AtomicBool>,
}

impl FakeRemotes {
    pub fn connect_to(&self, peer: Arc<Agent>) {
        *self.peer.lock().unwrap() = Some(peer);
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }
}

impl RemoteConnector for FakeRemotes {
    fn connect(&self, _remote: &Remote) -> Arc<dyn RemoteClient> {
        Arc::new(PeerClient {
            peer: self.peer.lock().unwrap().clone(),
            fail_starts: self.fail_starts.clone(),
        })
    }
}

struct PeerClient {
    peer: Option<Arc<Agent>>,
    fail_starts: Arc<AtomicBool>,
}

impl PeerClient {
    fn peer(&self) -> error::Result<&Arc<Agent>> {
        self.peer.as_ref().ok_or_else(|| AgentError::ExternalTool {
            stage: "remote request",
            source: anyhow!("connection refused"),
        })
    }
}

#[async_trait]
impl RemoteClient for PeerClient {
    async fn image(&self, name: &str) -> error::Result<Option<Image>> {
        self.peer()?.image().image(name)
    }

    async fn image_create(&self, image: &Image) -> error::Result<Image> {
        // both nodes share one filesystem, so the peer copies instead of using scp
        let mut image = image.clone();
        if let Ok(source) = Url::parse(&image.source) {
            if source.scheme() == "scp" {
                image.source = format!("file://{}", source.path());
            }
        }
        self.peer()?.image().image_create(image).await
    }

    async fn config(&self) -> error::Result<RemoteConfig> {
        let machine = self.peer()?.machine();
        let config = &machine.context().config;
        Ok(RemoteConfig {
            machine_path: config.base_path.clone(),
            migration_path: config.migration_path.clone(),
        })
    }

    async fn machine_create(&self, spec: &MachineSpec) -> error::Result<MachineDescriptor> {
        self.peer()?.machine().machine_create(spec.clone()).await
    }

    async fn machine_start(&self, name: &str) -> error::Result<()> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(AgentError::ExternalTool {
                stage: "remote request",
                source: anyhow!("connection reset by peer"),
            });
        }
        self.peer()?.machine().machine_start(name).await?;
        Ok(())
    }
}

/// Copies within the local filesystem, ignoring the host.
#[derive(Default)]
pub struct FakeTransfer;

#[async_trait]
impl Transfer for FakeTransfer {
    async fn make_dirs(&self, _host: &str, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn copy(&self, local: &Path, _host: &str, remote_path: &Path) -> Result<()> {
        tokio::fs::copy(local, remote_path).await?;
        Ok(())
    }
}

pub fn machine_spec(name: &str, image: &str) -> MachineSpec {
    MachineSpec {
        name: name.to_string(),
        image: image.to_string(),
        cores: 2,
        memory_mib: 512,
        disk_bytes: 0,
        interfaces: vec![],
    }
}

/// One fake node: a temp directory for every path plus the fakes behind the agent.
pub struct TestHost {
    dir: TempDir,
    pub devices: Arc<FakeDevices>,
    pub filter: Arc<FakeFilter>,
    pub qemu: Arc<FakeQemu>,
    pub block: Arc<FakeBlock>,
    pub runtime: Arc<FakeRuntime>,
    pub counters: Arc<FakeCounters>,
    pub notifier: Arc<RecordingNotifier>,
    pub remotes: Arc<FakeRemotes>,
    pub transfer: Arc<FakeTransfer>,
    hypervisor: PathBuf,
    password_tool: PathBuf,
}

impl TestHost {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();

        // stands in for the hypervisor: records its arguments and idles until signalled
        let hypervisor = dir.path().join("hypervisor.sh");
        let launches = dir.path().join("launches.log");
        write_script(
            &hypervisor,
            &format!(
                "#!/bin/sh\necho \"$@\" >> '{}'\nexec sleep 30\n",
                launches.display()
            ),
        );

        let password_tool = dir.path().join("passwd.sh");
        write_script(
            &password_tool,
            &format!("#!/bin/sh\ncat > /dev/null\necho '{TEST_PASSWORD_HASH}'\n"),
        );

        let runtime = Arc::new(FakeRuntime::new(dir.path().join("machines").join(
            BackendKind::Container.dir_name(),
        )));

        Self {
            devices: Arc::new(FakeDevices::with_bridge("kilnbr0")),
            filter: Arc::new(FakeFilter::default()),
            qemu: Arc::new(FakeQemu::default()),
            block: Arc::new(FakeBlock::default()),
            runtime,
            counters: Arc::new(FakeCounters::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            remotes: Arc::new(FakeRemotes::default()),
            transfer: Arc::new(FakeTransfer),
            hypervisor,
            password_tool,
            dir,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn path_string(&self, name: &str) -> String {
        self.path(name).to_string_lossy().to_string()
    }

    pub fn config(&self) -> AgentConfig {
        AgentConfig {
            store_path: self.path_string("store"),
            net_config: NetAgentConfig {
                bridge_name: "kilnbr0".to_string(),
                node_id: 0x07,
            },
            image_config: ImageAgentConfig {
                base_path: self.path_string("images"),
                ssh_user: None,
            },
            machine_config: MachineAgentConfig {
                base_path: self.path_string("machines"),
                migration_path: self.path_string("migration"),
                hypervisor_binary: self.hypervisor.to_string_lossy().to_string(),
                enable_kvm: false,
                start_grace: Duration::from_millis(100),
                storage: StorageBackend::Dir,
                password_tool: self.password_tool.to_string_lossy().to_string(),
                watchdog: None,
            },
            migration_config: MigrationAgentConfig {
                advertise_host: "node-a.test".to_string(),
            },
        }
    }

    fn bindings(&self) -> HostBindings {
        HostBindings {
            devices: self.devices.clone(),
            filter: self.filter.clone(),
            disk_tool: self.qemu.clone(),
            block: self.block.clone(),
            control: self.qemu.clone(),
            runtime: self.runtime.clone(),
            counters: self.counters.clone(),
            notifier: self.notifier.clone(),
            remotes: self.remotes.clone(),
            transfer: self.transfer.clone(),
        }
    }

    pub async fn agent(&self) -> Agent {
        self.agent_with(|_| {}).await
    }

    pub async fn agent_with(&self, customize: impl FnOnce(&mut AgentConfig)) -> Agent {
        let mut config = self.config();
        customize(&mut config);

        let agent = Agent::new(config, self.bindings()).await.unwrap();
        agent.init().await.unwrap();
        agent
    }

    pub async fn hypervisor_image(&self, agent: &Agent, name: &str) -> Image {
        let sources = self.path("sources");
        std::fs::create_dir_all(&sources).unwrap();
        let source = sources.join(format!("{name}.img"));
        std::fs::write(&source, b"{}").unwrap();

        agent
            .image()
            .image_create(Image::new(
                name,
                BackendKind::Hypervisor,
                format!("file://{}", source.display()),
            ))
            .await
            .unwrap()
    }

    pub async fn container_image(&self, agent: &Agent, name: &str) -> Image {
        let template = self.path("template");
        std::fs::create_dir_all(template.join("etc")).unwrap();
        std::fs::write(template.join("etc/hostname"), b"template\n").unwrap();

        let sources = self.path("sources");
        std::fs::create_dir_all(&sources).unwrap();
        let source = sources.join(format!("{name}.{ARCHIVE_EXTENSION}"));
        archive::pack_dir(&template, &source).await.unwrap();

        agent
            .image()
            .image_create(Image::new(
                name,
                BackendKind::Container,
                format!("file://{}", source.display()),
            ))
            .await
            .unwrap()
    }

    pub fn machine_path(&self, kind: BackendKind, name: &str) -> PathBuf {
        machine_dir(&self.path("machines"), kind.dir_name(), name)
    }

    pub fn disk_path(&self, name: &str) -> PathBuf {
        self.machine_path(BackendKind::Hypervisor, name)
            .join(DISK_FILE)
    }

    pub fn migration_payload(&self, kind: BackendKind, name: &str) -> PathBuf {
        self.path("migration").join(migration_file(kind, name))
    }

    pub fn container_config(&self, name: &str) -> String {
        std::fs::read_to_string(self.machine_path(BackendKind::Container, name).join("config"))
            .unwrap()
    }

    /// Command lines the hypervisor stand-in was started with, one per line.
    pub fn launches(&self) -> String {
        std::fs::read_to_string(self.path("launches.log")).unwrap_or_default()
    }

    pub fn failing_hypervisor(&self) -> String {
        let script = self.path("failing.sh");
        write_script(&script, "#!/bin/sh\necho 'bad arguments' >&2\nexit 1\n");
        script.to_string_lossy().to_string()
    }

    pub fn remote(&self) -> Remote {
        Remote {
            host: "node-b.test".to_string(),
            port: 7000,
        }
    }
}

pub fn write_script(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}
