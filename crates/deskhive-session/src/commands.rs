//! Container runtime command builders and output parsing.
//!
//! Every remote mutation goes through `docker` on the selected host, so the
//! exact command strings live here in one place. The desktop image always
//! exposes the VNC server on 5900 and the browser client on 6080; both are
//! published to ephemeral host ports and discovered after startup.

use deskhive_core::ContainerConfig;

/// Port the VNC server listens on inside the container.
pub const VNC_CONTAINER_PORT: u16 = 5900;
/// Port the browser-based client listens on inside the container.
pub const WEB_CONTAINER_PORT: u16 = 6080;

/// Container name for a user session, unique per creation attempt.
pub fn container_name(user_id: u64, unix_seconds: u64) -> String {
    format!("desk-{user_id}-{unix_seconds}")
}

/// Detached `docker run` for the desktop image with resource limits applied.
/// `--rm` keeps stopped containers from piling up on the host.
pub fn start_container(name: &str, image: &str, container: &ContainerConfig) -> String {
    format!(
        "docker run -d --rm --name {name} \
         -p 0:{VNC_CONTAINER_PORT} -p 0:{WEB_CONTAINER_PORT} \
         -e VNC_PASSWORD={password} -e RESOLUTION={resolution} \
         --shm-size={shm} --memory={memory} --cpus={cpus} {image}",
        password = container.vnc_password,
        resolution = container.resolution,
        shm = container.shm_size,
        memory = container.memory_limit,
        cpus = container.cpu_limit,
    )
}

pub fn stop_container(name: &str) -> String {
    format!("docker stop {name}")
}

pub fn port_mappings(name: &str) -> String {
    format!("docker port {name}")
}

/// Cheap host-side check that the runtime is up and the image is present.
pub fn image_probe(image: &str) -> String {
    format!("docker image inspect --format ok {image}")
}

/// Host ports discovered from `docker port` output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortMappings {
    pub vnc: Option<u16>,
    pub web: Option<u16>,
}

impl PortMappings {
    /// Both published ports, once the runtime has reported them.
    pub fn complete(&self) -> Option<(u16, u16)> {
        Some((self.vnc?, self.web?))
    }
}

/// Parses `docker port` output lines such as
/// `5900/tcp -> 0.0.0.0:49153` or `6080/tcp -> [::]:49154`.
///
/// The host port is whatever follows the last colon, which works for both
/// IPv4 and bracketed IPv6 bind addresses. Lines that do not parse are
/// skipped; the runtime repeats each mapping per address family and the
/// last occurrence wins.
pub fn parse_port_mappings(output: &str) -> PortMappings {
    let mut mappings = PortMappings::default();
    for line in output.lines() {
        let Some((container_side, host_side)) = line.split_once("->") else {
            continue;
        };
        let Some(port) = host_side
            .trim()
            .rsplit(':')
            .next()
            .and_then(|raw| raw.trim().parse::<u16>().ok())
        else {
            continue;
        };
        let container_side = container_side.trim();
        if container_side.starts_with("5900/tcp") {
            mappings.vnc = Some(port);
        } else if container_side.starts_with("6080/tcp") {
            mappings.web = Some(port);
        }
    }
    mappings
}
