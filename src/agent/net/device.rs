use anyhow::Result;
use async_trait::async_trait;

/// Host network device operations needed to wire a machine interface to the shared bridge.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Creates (or reopens) a TAP device, marks it persistent and brings it up.
    async fn create_tap(&self, name: &str) -> Result<()>;

    async fn attach_to_bridge(&self, name: &str, bridge: &str) -> Result<()>;

    /// Clears the persistent flag so the device goes away once its last user closes it.
    async fn release_tap(&self, name: &str) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;
}

#[cfg(feature = "daemon")]
pub use host::HostDevices;

#[cfg(feature = "daemon")]
mod host {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use futures_util::TryStreamExt;
    use rtnetlink::new_connection;
    use tokio::spawn;

    use super::DeviceControl;

    const SIOCBRADDIF: libc::Ioctl = 0x89a2;
    const TUN_PATH: &[u8] = b"/dev/net/tun\0";

    fn ifreq(name: &str) -> Result<libc::ifreq> {
        if name.len() >= libc::IFNAMSIZ {
            bail!("device name {name} is longer than {} bytes", libc::IFNAMSIZ - 1);
        }

        let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
        for (slot, byte) in req.ifr_name.iter_mut().zip(name.as_bytes()) {
            *slot = *byte as libc::c_char;
        }
        Ok(req)
    }

    fn owned(fd: libc::c_int, what: &str) -> Result<OwnedFd> {
        if fd < 0 {
            bail!("failed to open {what}: {}", std::io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn ioctl(fd: &OwnedFd, request: libc::Ioctl, req: &mut libc::ifreq, action: &str) -> Result<()> {
        if unsafe { libc::ioctl(fd.as_raw_fd(), request, req as *mut libc::ifreq) } != 0 {
            bail!("failed to {action}: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Index of the named link, if the kernel knows it.
    async fn link_index(name: &str) -> Result<Option<u32>> {
        let (connection, handle, _) = new_connection()?;
        spawn(connection);

        let mut links = handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(link) => Ok(link.map(|link| link.header.index)),
            // netlink answers ENODEV for unknown names
            Err(_) => Ok(None),
        }
    }

    fn tap_set_persist(name: &str, persist: bool) -> Result<()> {
        let mut req = ifreq(name)?;
        req.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as i16;

        let tun = owned(
            unsafe { libc::open(TUN_PATH.as_ptr().cast(), libc::O_RDWR | libc::O_CLOEXEC) },
            "/dev/net/tun",
        )?;
        ioctl(&tun, libc::TUNSETIFF, &mut req, &format!("open tap {name}"))?;

        if unsafe { libc::ioctl(tun.as_raw_fd(), libc::TUNSETPERSIST, persist as libc::c_int) } != 0 {
            bail!(
                "failed to set persist={persist} on {name}: {}",
                std::io::Error::last_os_error()
            );
        }
        Ok(())
    }

    fn control_socket() -> Result<OwnedFd> {
        owned(
            unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) },
            "control socket",
        )
    }

    fn link_up(name: &str) -> Result<()> {
        let sock = control_socket()?;
        let mut req = ifreq(name)?;

        ioctl(&sock, libc::SIOCGIFFLAGS, &mut req, &format!("read flags of {name}"))?;
        unsafe { req.ifr_ifru.ifru_flags |= libc::IFF_UP as i16 };
        ioctl(&sock, libc::SIOCSIFFLAGS, &mut req, &format!("bring {name} up"))
    }

    fn bridge_add(bridge: &str, index: u32) -> Result<()> {
        let sock = control_socket()?;
        let mut req = ifreq(bridge)?;
        req.ifr_ifru.ifru_ifindex = index as i32;

        if unsafe { libc::ioctl(sock.as_raw_fd(), SIOCBRADDIF, &mut req as *mut libc::ifreq) } == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        // already a port of the bridge
        if err.raw_os_error() == Some(libc::EBUSY) {
            return Ok(());
        }
        bail!("failed to add device {index} to {bridge}: {err}")
    }

    pub struct HostDevices;

    #[async_trait]
    impl DeviceControl for HostDevices {
        async fn exists(&self, name: &str) -> Result<bool> {
            Ok(link_index(name).await?.is_some())
        }

        async fn create_tap(&self, name: &str) -> Result<()> {
            tap_set_persist(name, true)?;
            link_up(name)
        }

        async fn attach_to_bridge(&self, name: &str, bridge: &str) -> Result<()> {
            let Some(index) = link_index(name).await? else {
                bail!("device {name} not found");
            };
            bridge_add(bridge, index)
        }

        async fn release_tap(&self, name: &str) -> Result<()> {
            tap_set_persist(name, false)
        }

        async fn delete(&self, name: &str) -> Result<()> {
            let Some(index) = link_index(name).await? else {
                bail!("device {name} not found");
            };

            let (connection, handle, _) = new_connection()?;
            spawn(connection);
            handle.link().del(index).execute().await?;
            Ok(())
        }
    }
}
