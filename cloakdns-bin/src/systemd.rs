//! Readiness notification for socket-activated service managers.

/// Tell the service manager we are serving. A no-op without a notify
/// socket or on non-unix platforms.
pub fn notify_ready() {
    #[cfg(unix)]
    {
        let Ok(path) = std::env::var("NOTIFY_SOCKET") else {
            return;
        };
        if let Err(e) = send_notification(&path, b"READY=1") {
            tracing::debug!("sd_notify failed: {e}");
        } else {
            tracing::info!("service manager notified of readiness");
        }
    }
}

#[cfg(unix)]
fn send_notification(path: &str, payload: &[u8]) -> std::io::Result<()> {
    use std::os::unix::net::{SocketAddr, UnixDatagram};

    let addr = if let Some(name) = path.strip_prefix('@') {
        #[cfg(target_os = "linux")]
        {
            use std::os::linux::net::SocketAddrExt;
            SocketAddr::from_abstract_name(name.as_bytes())?
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = name;
            return Err(std::io::Error::other("abstract sockets are linux-only"));
        }
    } else {
        SocketAddr::from_pathname(path)?
    };

    let socket = UnixDatagram::unbound()?;
    socket.send_to_addr(payload, &addr)?;
    Ok(())
}
