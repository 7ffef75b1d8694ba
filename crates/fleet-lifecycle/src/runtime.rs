//! Argument vectors for the runtime CLI.
//!
//! Commands are built as argv and rendered through
//! [`fleet_runner::display_command`], so values are always quoted correctly.

use crate::config::LifecycleConfig;

/// Builds runtime CLI invocations.
#[derive(Debug, Clone)]
pub struct RuntimeCli {
    pub bin: String,
    pub image: String,
    pub storage_pool: String,
    pub interface: String,
}

impl RuntimeCli {
    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self {
            bin: config.runtime_bin.clone(),
            image: config.image.clone(),
            storage_pool: config.storage_pool.clone(),
            interface: config.interface.clone(),
        }
    }

    fn argv(&self, args: &[&str]) -> Vec<String> {
        std::iter::once(self.bin.as_str()).chain(args.iter().copied()).map(String::from).collect()
    }

    pub fn launch(&self, container_id: &str, ram_mb: u64, cpu: u32) -> Vec<String> {
        let memory = format!("limits.memory={ram_mb}MB");
        let cpu = format!("limits.cpu={cpu}");
        self.argv(&[
            "launch",
            &self.image,
            container_id,
            "--config",
            &memory,
            "--config",
            &cpu,
            "-s",
            &self.storage_pool,
        ])
    }

    pub fn start(&self, container_id: &str) -> Vec<String> {
        self.argv(&["start", container_id])
    }

    pub fn stop(&self, container_id: &str) -> Vec<String> {
        self.argv(&["stop", container_id])
    }

    pub fn restart(&self, container_id: &str) -> Vec<String> {
        self.argv(&["restart", container_id])
    }

    pub fn delete_force(&self, container_id: &str) -> Vec<String> {
        self.argv(&["delete", container_id, "--force"])
    }

    pub fn stop_all_force(&self) -> Vec<String> {
        self.argv(&["stop", "--all", "--force"])
    }

    pub fn snapshot(&self, container_id: &str, snapshot: &str) -> Vec<String> {
        self.argv(&["snapshot", container_id, snapshot])
    }

    pub fn restore(&self, container_id: &str, snapshot: &str) -> Vec<String> {
        self.argv(&["restore", container_id, snapshot])
    }

    pub fn info(&self, container_id: &str) -> Vec<String> {
        self.argv(&["info", container_id])
    }

    /// `config device set <id> <iface> <key>=<value>`
    pub fn device_set(&self, container_id: &str, key: &str, value: &str) -> Vec<String> {
        let setting = format!("{key}={value}");
        self.argv(&["config", "device", "set", container_id, &self.interface, &setting])
    }

    /// Program and arguments run inside the container, no shell.
    pub fn exec(&self, container_id: &str, args: &[&str]) -> Vec<String> {
        let mut argv = self.argv(&["exec", container_id, "--"]);
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    /// Non-interactive shell command inside the container.
    pub fn exec_shell(&self, container_id: &str, command: &str) -> Vec<String> {
        self.exec(container_id, &["bash", "-c", command])
    }

    // ─── tmate ───────────────────────────────────────────────────────────

    pub fn tmate_installed(&self, container_id: &str) -> Vec<String> {
        self.exec(container_id, &["which", "tmate"])
    }

    /// Package steps that install tmate, starting from clean apt lists.
    pub fn tmate_install(&self, container_id: &str) -> Vec<Vec<String>> {
        vec![
            self.exec(container_id, &["apt-get", "clean"]),
            self.exec_shell(container_id, "rm -f /var/lib/apt/lists/*"),
            self.exec_shell(
                container_id,
                "apt-get update --allow-releaseinfo-change -y || apt-get update -y",
            ),
            self.exec(container_id, &["apt-get", "install", "tmate", "-y", "--no-install-recommends"]),
        ]
    }

    /// Detached tmate session on its own socket.
    pub fn tmate_start(&self, container_id: &str, socket: &str) -> Vec<String> {
        self.exec(container_id, &["tmate", "-S", socket, "new-session", "-d"])
    }

    /// Prints the session's `ssh ...` connection command.
    pub fn tmate_ssh(&self, container_id: &str, socket: &str) -> Vec<String> {
        self.exec(container_id, &["tmate", "-S", socket, "display", "-p", "#{tmate_ssh}"])
    }
}
