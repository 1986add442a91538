//! Gratuitous ARP announcements for a guest's NICs.

use std::{
    net::Ipv4Addr,
    os::fd::AsRawFd,
    str::FromStr,
    time::Duration,
};

use nix::{
    libc,
    net::if_::if_nametoindex,
    sys::socket::{
        AddressFamily, LinkAddr, MsgFlags, SockFlag, SockType, SockaddrLike, sendto, socket,
    },
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::desc::GuestNetwork;

const ETH_P_ARP: u16 = 0x0806;
const ETH_P_IPV4: u16 = 0x0800;
const ETHERNET_FRAME_SIZE: usize = 14;
const ARP4_PKT_SIZE: usize = 28;

/// Rounds of announcements after a start.
pub const ARP_ROUNDS: usize = 5;
pub const ARP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ArpError {
    #[error("invalid mac address: {0}")]
    Mac(String),

    #[error("invalid ipv4 address: {0}")]
    Ip(String),

    #[error("interface {ifname} not found")]
    Interface {
        ifname: String,
        #[source]
        source: nix::Error,
    },

    #[error("failed to send arp on {ifname}")]
    Send {
        ifname: String,
        #[source]
        source: nix::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl FromStr for MacAddress {
    type Err = ArpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mac = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in mac.iter_mut() {
            let part = parts.next().ok_or_else(|| ArpError::Mac(s.to_owned()))?;
            if part.len() != 2 {
                return Err(ArpError::Mac(s.to_owned()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ArpError::Mac(s.to_owned()))?;
        }
        if parts.next().is_some() {
            return Err(ArpError::Mac(s.to_owned()));
        }
        Ok(Self(mac))
    }
}

/// An ARP request announcing `spa` at `sha`, addressed to everyone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GratuitousArp {
    pub sha: MacAddress,
    pub spa: Ipv4Addr,
}

impl GratuitousArp {
    pub fn for_nic(nic: &GuestNetwork) -> Result<Self, ArpError> {
        let sha = nic.mac.parse()?;
        let spa = nic
            .ip
            .parse()
            .map_err(|_| ArpError::Ip(nic.ip.clone()))?;
        Ok(Self { sha, spa })
    }

    /// Ethernet frame carrying the request, broadcast from the sender's MAC.
    pub fn frame(&self) -> [u8; ETHERNET_FRAME_SIZE + ARP4_PKT_SIZE] {
        let mut pkt = [0u8; ETHERNET_FRAME_SIZE + ARP4_PKT_SIZE];
        pkt[0..6].copy_from_slice(MacAddress::BROADCAST.as_bytes());
        pkt[6..12].copy_from_slice(self.sha.as_bytes());
        pkt[12..14].copy_from_slice(&ETH_P_ARP.to_be_bytes());

        let arp = &mut pkt[ETHERNET_FRAME_SIZE..];
        arp[0..2].copy_from_slice(&1u16.to_be_bytes()); // ethernet
        arp[2..4].copy_from_slice(&ETH_P_IPV4.to_be_bytes());
        arp[4] = 6;
        arp[5] = 4;
        arp[6..8].copy_from_slice(&1u16.to_be_bytes()); // request
        arp[8..14].copy_from_slice(self.sha.as_bytes());
        arp[14..18].copy_from_slice(&self.spa.octets());
        arp[18..24].copy_from_slice(MacAddress::ZERO.as_bytes());
        arp[24..28].copy_from_slice(&Ipv4Addr::BROADCAST.octets());
        pkt
    }
}

fn link_addr(ifindex: u32) -> Option<LinkAddr> {
    // SAFETY: sockaddr_ll is plain old data; all-zero is a valid value.
    let mut ll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    ll.sll_family = libc::AF_PACKET as u16;
    ll.sll_protocol = ETH_P_ARP.to_be();
    ll.sll_ifindex = ifindex as i32;
    ll.sll_halen = 6;
    ll.sll_addr[..6].copy_from_slice(MacAddress::BROADCAST.as_bytes());
    // SAFETY: the pointer and length describe the sockaddr_ll above.
    unsafe {
        LinkAddr::from_raw(
            (&ll as *const libc::sockaddr_ll).cast(),
            Some(std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t),
        )
    }
}

/// Sends one announcement for `nic` out of its tap interface.
pub fn send_gratuitous_arp(nic: &GuestNetwork) -> Result<(), ArpError> {
    let frame = GratuitousArp::for_nic(nic)?.frame();
    let send_err = |source| ArpError::Send {
        ifname: nic.ifname.clone(),
        source,
    };

    let ifindex = if_nametoindex(nic.ifname.as_str()).map_err(|source| ArpError::Interface {
        ifname: nic.ifname.clone(),
        source,
    })?;
    let addr = link_addr(ifindex).ok_or_else(|| send_err(nix::Error::EINVAL))?;
    let sock = socket(
        AddressFamily::Packet,
        SockType::Raw,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(send_err)?;
    sendto(sock.as_raw_fd(), &frame, &addr, MsgFlags::empty()).map_err(send_err)?;
    debug!(ifname = %nic.ifname, mac = %nic.mac, ip = %nic.ip, "sent gratuitous arp");
    Ok(())
}

/// Announces every NIC for a few seconds in the background.
///
/// Failures are logged per NIC and never stop the remaining rounds.
pub fn presend_arp(nics: Vec<GuestNetwork>) -> JoinHandle<()> {
    tokio::spawn(async move {
        for round in 0..ARP_ROUNDS {
            for nic in &nics {
                if let Err(err) = send_gratuitous_arp(nic) {
                    warn!(round, ifname = %nic.ifname, "presend arp failed: {err}");
                }
            }
            tokio::time::sleep(ARP_INTERVAL).await;
        }
    })
}
