//! Default configuration template with all options documented.

/// Generate the default config template.
pub fn default_config_template() -> String {
    r##"# Warden Configuration
# ====================
# Uncomment and modify settings as needed. Changes require a restart.
#
# Environment variable substitution is supported: ${ENV_VAR} or ${ENV_VAR:-default}

# ══════════════════════════════════════════════════════════════════════════════
# SERVER
# ══════════════════════════════════════════════════════════════════════════════

[server]
bind = "127.0.0.1"                # Address for the NoVNC relay and status API
port = 7480

# ══════════════════════════════════════════════════════════════════════════════
# ASSISTANT
# ══════════════════════════════════════════════════════════════════════════════

[assistant]
name = "Andy"                     # Trigger word and display name
provider = "anthropic"            # anthropic | openai | openrouter | ollama | gemini
# model = "claude-sonnet-4-5"
enable_thinking = false

# ══════════════════════════════════════════════════════════════════════════════
# PATHS
# ══════════════════════════════════════════════════════════════════════════════

[paths]
# project_root = "/srv/warden/project"   # Mounted rw for the main group
# groups_dir = "/srv/warden/groups"      # Default: <data_dir>/groups
# data_dir = "/srv/warden/data"          # Default: platform data dir

# ══════════════════════════════════════════════════════════════════════════════
# AGENT CONTAINERS
# ══════════════════════════════════════════════════════════════════════════════

[container]
cli = "docker"                    # Container CLI (docker, podman)
image = "warden-agent:latest"
# build_context = "./container"   # Directory with the agent Dockerfile
default_mode = "persistent"       # persistent | one-shot
run_timeout_secs = 1800           # Max time for one agent run
startup_timeout_secs = 60         # Max time for a new container to become ready
idle_timeout_secs = 1800          # Reclaim persistent containers after this much idle time
idle_poll_interval_secs = 60
interrupt_grace_secs = 10         # Time between interrupt and forced kill
max_log_bytes = 262144
# memory_limit = "2g"
# cpu_quota = 2.0
no_network = false

# ══════════════════════════════════════════════════════════════════════════════
# SCHEDULER
# ══════════════════════════════════════════════════════════════════════════════

[scheduler]
poll_interval_secs = 60
# timezone = "America/New_York"   # Timezone for cron expressions (default: UTC)

# ══════════════════════════════════════════════════════════════════════════════
# DESKTOP SANDBOX
# ══════════════════════════════════════════════════════════════════════════════

[sandbox]
enabled = true
image = "warden-desktop:latest"
container_name = "warden-sandbox"
web_port = 6080                   # noVNC port inside the sandbox
host_port = 0                     # 0 = pick a free port
ws_path = "websockify"
startup_timeout_secs = 90
idle_timeout_secs = 600
idle_poll_interval_secs = 30
password_rotation_secs = 3600
connect_timeout_secs = 10
# public_base_url = "https://warden.example.com"

# ══════════════════════════════════════════════════════════════════════════════
# MOUNTS
# ══════════════════════════════════════════════════════════════════════════════

[mounts]
# allowlist_path = "~/.config/warden/mount-allowlist.json"
# Generate a starter file with: warden mounts template
"##
    .to_string()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::WardenConfig};

    #[test]
    fn template_parses_as_config() {
        let cfg: WardenConfig = toml::from_str(&default_config_template()).unwrap();
        assert_eq!(cfg.server.port, 7480);
        assert_eq!(cfg.sandbox.web_port, 6080);
        assert_eq!(cfg.assistant.name, "Andy");
    }
}
