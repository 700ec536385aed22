//! Virtual TCP networking inside the WireGuard tunnel.
//!
//! A single dataplane task owns the UDP socket, one boringtun session per
//! peer, and a smoltcp interface over an in-memory packet device. Everything
//! else talks to it through [`VirtualNet`], which hands out [`VirtualStream`]
//! connections and [`VirtualListener`] accept queues bridged over channels.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use boringtun::noise::{Tunn, TunnResult};
use bytes::{Buf, Bytes};
use ipnet::IpNet;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer as TcpSocketBuffer, State};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use broker_shared::{Error, Result};

const UDP_BUF: usize = 65536;
const TCP_SOCKET_BUF: usize = 262144;
const LOCAL_PORT_START: u16 = 40000;
const LOCAL_PORT_END: u16 = 65000;
const WG_TIMER_TICK: Duration = Duration::from_millis(100);
const LISTEN_BACKLOG: usize = 8;
const ACCEPT_CHANNEL_CAP: usize = 64;
const COMMAND_CHANNEL_CAP: usize = 64;

/// One programmed peer: its noise session, last known endpoint, and the
/// address range routed to it.
pub struct PeerConfig {
    pub tunn: Tunn,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: IpNet,
}

pub struct NetstackConfig {
    pub local_addr: IpAddr,
    pub mtu: usize,
    pub listen_port: u16,
    pub peers: Vec<PeerConfig>,
}

/// Handle for dialing and listening inside the tunnel. Cheap to clone.
#[derive(Clone)]
pub struct VirtualNet {
    cmd_tx: mpsc::Sender<Command>,
}

impl VirtualNet {
    /// Open a virtual TCP connection to `remote`. Resolves once the
    /// handshake completes (or the peer refuses).
    pub async fn dial(&self, remote: SocketAddr) -> Result<VirtualStream> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Dial {
                remote,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Tunnel("tunnel is down".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Tunnel("tunnel is down".into()))?
    }

    /// Open a virtual TCP listener on `port`.
    pub async fn listen(&self, port: u16) -> Result<VirtualListener> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Listen {
                port,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Tunnel("tunnel is down".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Tunnel("tunnel is down".into()))?
    }
}

/// Owner handle for the dataplane task.
pub struct NetstackHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl NetstackHandle {
    /// Stop the dataplane and wait for it to exit. Open virtual connections
    /// are aborted.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| Error::Tunnel(format!("dataplane task failed: {e}")))
    }
}

/// Stream of accepted in-tunnel connections.
pub struct VirtualListener {
    rx: mpsc::Receiver<(VirtualStream, SocketAddr)>,
    port: u16,
}

impl VirtualListener {
    /// Next established connection; `None` once the tunnel is down.
    pub async fn accept(&mut self) -> Option<(VirtualStream, SocketAddr)> {
        self.rx.recv().await
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// A virtual TCP connection. Reads and writes are byte chunks bridged to
/// the dataplane; dropping the stream (or `poll_shutdown`) closes it.
pub struct VirtualStream {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    wake: Arc<Notify>,
    leftover: Option<Bytes>,
}

impl VirtualStream {
    fn new(
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            tx: Some(tx),
            rx,
            wake,
            leftover: None,
        }
    }
}

impl AsyncRead for VirtualStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(chunk) = this.leftover.as_mut() {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n == chunk.len() {
                    this.leftover = None;
                } else {
                    chunk.advance(n);
                }
                return Poll::Ready(Ok(()));
            }

            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    if !chunk.is_empty() {
                        this.leftover = Some(chunk);
                    }
                }
                // Sender dropped by the dataplane: clean EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for VirtualStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match &this.tx {
            Some(tx) => {
                if tx.send(Bytes::copy_from_slice(buf)).is_err() {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                this.wake.notify_one();
                Poll::Ready(Ok(buf.len()))
            }
            None => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.tx = None;
        this.wake.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        self.tx = None;
        self.wake.notify_one();
    }
}

enum Command {
    Dial {
        remote: SocketAddr,
        reply: oneshot::Sender<Result<VirtualStream>>,
    },
    Listen {
        port: u16,
        reply: oneshot::Sender<Result<VirtualListener>>,
    },
}

/// Spawn the dataplane for a configured tunnel.
pub async fn spawn(config: NetstackConfig) -> Result<(VirtualNet, NetstackHandle)> {
    let bind_addr: SocketAddr = if config
        .peers
        .iter()
        .any(|p| matches!(p.endpoint, Some(ep) if ep.is_ipv6()))
    {
        (Ipv6Addr::UNSPECIFIED, config.listen_port).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, config.listen_port).into()
    };
    let udp = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| Error::Tunnel(format!("failed to bind tunnel UDP socket: {e}")))?;

    let mut device = VirtualDevice::new(config.mtu);
    let mut iface = Interface::new(Config::new(HardwareAddress::Ip), &mut device, smoltcp_now());
    let local_ip = ip_to_smoltcp(config.local_addr);
    iface.update_ip_addrs(|addrs| {
        let prefix = match config.local_addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let _ = addrs.push(IpCidr::new(local_ip, prefix));
    });
    let _ = iface
        .routes_mut()
        .add_default_ipv4_route(Ipv4Addr::new(0, 0, 0, 1));
    let _ = iface
        .routes_mut()
        .add_default_ipv6_route(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1));

    let peers = config
        .peers
        .into_iter()
        .map(|p| PeerState {
            tunn: p.tunn,
            current_endpoint: p.endpoint,
            allowed_ips: p.allowed_ips,
        })
        .collect();

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAP);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dataplane = Dataplane {
        udp,
        peers,
        device,
        iface,
        sockets: SocketSet::new(vec![]),
        conns: Vec::new(),
        listeners: HashMap::new(),
        local_ip,
        next_port: LOCAL_PORT_START,
        cmd_rx,
        shutdown: shutdown_rx,
        wake: Arc::new(Notify::new()),
    };

    let task = tokio::spawn(dataplane.run());

    Ok((
        VirtualNet { cmd_tx },
        NetstackHandle {
            shutdown: shutdown_tx,
            task,
        },
    ))
}

struct PeerState {
    tunn: Tunn,
    current_endpoint: Option<SocketAddr>,
    allowed_ips: IpNet,
}

struct ConnEntry {
    handle: SocketHandle,
    to_client: Option<mpsc::UnboundedSender<Bytes>>,
    from_client: mpsc::UnboundedReceiver<Bytes>,
    pending_out: VecDeque<Bytes>,
    reply: Option<oneshot::Sender<Result<VirtualStream>>>,
    pending_stream: Option<VirtualStream>,
    client_gone: bool,
}

struct ListenerEntry {
    accept_tx: mpsc::Sender<(VirtualStream, SocketAddr)>,
    handles: Vec<SocketHandle>,
}

struct Dataplane {
    udp: UdpSocket,
    peers: Vec<PeerState>,
    device: VirtualDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    conns: Vec<ConnEntry>,
    listeners: HashMap<u16, ListenerEntry>,
    local_ip: IpAddress,
    next_port: u16,
    cmd_rx: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
    wake: Arc<Notify>,
}

impl Dataplane {
    async fn run(mut self) {
        let mut udp_buf = vec![0u8; UDP_BUF];
        let mut scratch = vec![0u8; UDP_BUF + 128];
        let mut timer_deadline = Instant::now();
        let mut cmds_open = true;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            if Instant::now() >= timer_deadline {
                self.update_wireguard_timers(&mut scratch);
                timer_deadline = Instant::now() + WG_TIMER_TICK;
            }

            while let Ok(cmd) = self.cmd_rx.try_recv() {
                self.handle_command(cmd);
            }

            loop {
                match self.udp.try_recv_from(&mut udp_buf) {
                    Ok((n, src)) => self.handle_datagram(&udp_buf[..n], src, &mut scratch),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!(error = %e, "tunnel.udp_recv_error");
                        break;
                    }
                }
            }

            let now = smoltcp_now();
            let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);

            self.pump_listeners();
            self.pump_connections();

            // Second poll flushes anything the pumps queued on the sockets.
            let now = smoltcp_now();
            let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);

            while let Some(packet) = self.device.outbound.pop_front() {
                self.encapsulate_and_send(&packet, &mut scratch);
            }

            if !self.device.inbound.is_empty() {
                continue;
            }

            let delay = self
                .iface
                .poll_delay(now, &self.sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
                .unwrap_or(WG_TIMER_TICK);
            let wait = delay
                .min(timer_deadline.saturating_duration_since(Instant::now()))
                .min(WG_TIMER_TICK);

            tokio::select! {
                _ = self.udp.readable() => {}
                cmd = self.cmd_rx.recv(), if cmds_open => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        // All VirtualNet handles dropped; keep serving
                        // existing connections until shutdown.
                        None => cmds_open = false,
                    }
                }
                _ = self.wake.notified() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.close_all(&mut scratch);
    }

    fn update_wireguard_timers(&mut self, scratch: &mut [u8]) {
        for peer in &mut self.peers {
            let result = peer.tunn.update_timers(scratch);
            if let TunnResult::WriteToNetwork(out) = result {
                if let Some(endpoint) = peer.current_endpoint {
                    let _ = self.udp.try_send_to(out, endpoint);
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Dial { remote, reply } => self.add_dial(remote, reply),
            Command::Listen { port, reply } => self.add_listener(port, reply),
        }
    }

    fn add_dial(&mut self, remote: SocketAddr, reply: oneshot::Sender<Result<VirtualStream>>) {
        let local_port = self.next_port;
        self.next_port = if self.next_port >= LOCAL_PORT_END {
            LOCAL_PORT_START
        } else {
            self.next_port + 1
        };

        let mut sock = TcpSocket::new(
            TcpSocketBuffer::new(vec![0u8; TCP_SOCKET_BUF]),
            TcpSocketBuffer::new(vec![0u8; TCP_SOCKET_BUF]),
        );
        let remote_endpoint = IpEndpoint::new(ip_to_smoltcp(remote.ip()), remote.port());
        let local_endpoint = IpListenEndpoint {
            addr: Some(self.local_ip),
            port: local_port,
        };

        match sock.connect(self.iface.context(), remote_endpoint, local_endpoint) {
            Ok(()) => {
                let handle = self.sockets.add(sock);
                let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
                let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();
                let stream = VirtualStream::new(from_client_tx, to_client_rx, self.wake.clone());
                self.conns.push(ConnEntry {
                    handle,
                    to_client: Some(to_client_tx),
                    from_client: from_client_rx,
                    pending_out: VecDeque::new(),
                    reply: Some(reply),
                    pending_stream: Some(stream),
                    client_gone: false,
                });
            }
            Err(e) => {
                let _ = reply.send(Err(Error::Tunnel(format!("virtual connect failed: {e:?}"))));
            }
        }
    }

    fn add_listener(&mut self, port: u16, reply: oneshot::Sender<Result<VirtualListener>>) {
        if self.listeners.contains_key(&port) {
            let _ = reply.send(Err(Error::Tunnel(format!(
                "virtual port {port} is already listening"
            ))));
            return;
        }

        let mut handles = Vec::with_capacity(LISTEN_BACKLOG);
        for _ in 0..LISTEN_BACKLOG {
            match self.new_listen_socket(port) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles {
                        self.sockets.remove(handle);
                    }
                    let _ = reply.send(Err(e));
                    return;
                }
            }
        }

        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_CHANNEL_CAP);
        self.listeners.insert(port, ListenerEntry { accept_tx, handles });
        let _ = reply.send(Ok(VirtualListener {
            rx: accept_rx,
            port,
        }));
    }

    fn new_listen_socket(&mut self, port: u16) -> Result<SocketHandle> {
        let mut sock = TcpSocket::new(
            TcpSocketBuffer::new(vec![0u8; TCP_SOCKET_BUF]),
            TcpSocketBuffer::new(vec![0u8; TCP_SOCKET_BUF]),
        );
        sock.listen(IpListenEndpoint {
            addr: Some(self.local_ip),
            port,
        })
        .map_err(|e| Error::Tunnel(format!("virtual listen on port {port} failed: {e:?}")))?;
        Ok(self.sockets.add(sock))
    }

    /// Match an incoming datagram to a peer session: by last known endpoint
    /// first, otherwise by trial decapsulation (which also learns roaming or
    /// passive peer endpoints).
    fn handle_datagram(&mut self, datagram: &[u8], src: SocketAddr, scratch: &mut [u8]) {
        let candidates: Vec<usize> = match self
            .peers
            .iter()
            .position(|p| p.current_endpoint == Some(src))
        {
            Some(i) => vec![i],
            None => (0..self.peers.len()).collect(),
        };

        for i in candidates {
            match self.peers[i].tunn.decapsulate(None, datagram, scratch) {
                TunnResult::Done => {
                    self.peers[i].current_endpoint = Some(src);
                    return;
                }
                TunnResult::Err(_) => continue,
                TunnResult::WriteToNetwork(out) => {
                    let _ = self.udp.try_send_to(out, src);
                    // Flush any packets boringtun queued behind the handshake.
                    let mut flush = vec![0u8; UDP_BUF];
                    while let TunnResult::WriteToNetwork(out) =
                        self.peers[i].tunn.decapsulate(None, &[], &mut flush)
                    {
                        if self.udp.try_send_to(out, src).is_err() {
                            break;
                        }
                    }
                    self.peers[i].current_endpoint = Some(src);
                    return;
                }
                TunnResult::WriteToTunnelV4(packet, _) => {
                    self.device.inbound.push_back(packet.to_vec());
                    self.peers[i].current_endpoint = Some(src);
                    return;
                }
                TunnResult::WriteToTunnelV6(packet, _) => {
                    self.device.inbound.push_back(packet.to_vec());
                    self.peers[i].current_endpoint = Some(src);
                    return;
                }
            }
        }

        debug!(src = %src, "tunnel.unmatched_datagram");
    }

    /// Route an egress IP packet to the peer whose allowed range contains
    /// its destination, encrypt, and send.
    fn encapsulate_and_send(&mut self, packet: &[u8], scratch: &mut [u8]) {
        let Some(dst) = packet_dst(packet) else {
            return;
        };
        let Some(peer) = self.peers.iter_mut().find(|p| p.allowed_ips.contains(&dst)) else {
            debug!(dst = %dst, "tunnel.no_route");
            return;
        };

        match peer.tunn.encapsulate(packet, scratch) {
            TunnResult::WriteToNetwork(out) => {
                if let Some(endpoint) = peer.current_endpoint {
                    let _ = self.udp.try_send_to(out, endpoint);
                } else {
                    debug!(dst = %dst, "tunnel.peer_has_no_endpoint");
                }
            }
            TunnResult::Done => {}
            TunnResult::Err(e) => debug!(error = ?e, "tunnel.encapsulate_error"),
            _ => {}
        }
    }

    /// Promote established listener sockets into connections and replenish
    /// the listening backlog for each port.
    fn pump_listeners(&mut self) {
        let ports: Vec<u16> = self.listeners.keys().copied().collect();

        for port in ports {
            let handles: Vec<SocketHandle> = self.listeners[&port].handles.clone();
            let mut kept: Vec<SocketHandle> = Vec::with_capacity(handles.len());
            let mut listener_dead = false;

            for handle in handles {
                let sock = self.sockets.get_mut::<TcpSocket>(handle);

                if !sock.may_send() {
                    if sock.is_open() {
                        kept.push(handle);
                    } else {
                        // Died without establishing; recycled below.
                        self.sockets.remove(handle);
                    }
                    continue;
                }

                // Established: hand it to the accept queue.
                let remote = sock
                    .remote_endpoint()
                    .map(endpoint_to_socket_addr)
                    .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

                let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
                let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();
                let stream = VirtualStream::new(from_client_tx, to_client_rx, self.wake.clone());

                let accepted = self.listeners[&port].accept_tx.try_send((stream, remote));
                match accepted {
                    Ok(()) => {
                        self.conns.push(ConnEntry {
                            handle,
                            to_client: Some(to_client_tx),
                            from_client: from_client_rx,
                            pending_out: VecDeque::new(),
                            reply: None,
                            pending_stream: None,
                            client_gone: false,
                        });
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(port, "tunnel.accept_queue_full");
                        self.sockets.get_mut::<TcpSocket>(handle).abort();
                        kept.push(handle);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        listener_dead = true;
                        self.sockets.get_mut::<TcpSocket>(handle).abort();
                        kept.push(handle);
                    }
                }
            }

            if listener_dead {
                for handle in kept {
                    self.sockets.get_mut::<TcpSocket>(handle).abort();
                    self.sockets.remove(handle);
                }
                self.listeners.remove(&port);
                continue;
            }

            while kept.len() < LISTEN_BACKLOG {
                match self.new_listen_socket(port) {
                    Ok(handle) => kept.push(handle),
                    Err(_) => break,
                }
            }
            if let Some(listener) = self.listeners.get_mut(&port) {
                listener.handles = kept;
            }
        }
    }

    fn pump_connections(&mut self) {
        let mut closed = Vec::new();

        for (i, entry) in self.conns.iter_mut().enumerate() {
            let sock = self.sockets.get_mut::<TcpSocket>(entry.handle);

            // Resolve a pending dial once the handshake settles.
            if entry.reply.is_some() {
                if sock.may_send() {
                    if let (Some(reply), Some(stream)) =
                        (entry.reply.take(), entry.pending_stream.take())
                    {
                        let _ = reply.send(Ok(stream));
                    }
                } else if sock.state() == State::Closed {
                    if let Some(reply) = entry.reply.take() {
                        let _ = reply.send(Err(Error::Tunnel("virtual connection refused".into())));
                    }
                    entry.pending_stream = None;
                    closed.push(i);
                    continue;
                } else {
                    continue;
                }
            }

            // Socket to client.
            let mut recv_buf = [0u8; 4096];
            while sock.can_recv() {
                match sock.recv_slice(&mut recv_buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let delivered = entry
                            .to_client
                            .as_ref()
                            .map(|tx| tx.send(Bytes::copy_from_slice(&recv_buf[..n])).is_ok())
                            .unwrap_or(false);
                        if !delivered {
                            sock.abort();
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            // Remote finished sending and the buffer is drained: EOF.
            if !sock.may_recv() && entry.to_client.is_some() {
                entry.to_client = None;
            }

            // Client to socket.
            if !entry.client_gone {
                loop {
                    match entry.from_client.try_recv() {
                        Ok(chunk) => entry.pending_out.push_back(chunk),
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            entry.client_gone = true;
                            break;
                        }
                    }
                }
            }
            while sock.can_send() {
                let Some(front) = entry.pending_out.front_mut() else {
                    break;
                };
                match sock.send_slice(front) {
                    Ok(sent) if sent == front.len() => {
                        entry.pending_out.pop_front();
                    }
                    Ok(sent) => {
                        front.advance(sent);
                        break;
                    }
                    Err(_) => break,
                }
            }
            if entry.client_gone && entry.pending_out.is_empty() {
                sock.close();
            }

            if !sock.is_open() {
                closed.push(i);
            }
        }

        for i in closed.into_iter().rev() {
            let entry = self.conns.remove(i);
            self.sockets.remove(entry.handle);
        }
    }

    /// Abort everything and flush the final control packets out.
    fn close_all(&mut self, scratch: &mut [u8]) {
        for entry in &self.conns {
            self.sockets.get_mut::<TcpSocket>(entry.handle).abort();
        }
        for listener in self.listeners.values() {
            for handle in &listener.handles {
                self.sockets.get_mut::<TcpSocket>(*handle).abort();
            }
        }

        let _ = self
            .iface
            .poll(smoltcp_now(), &mut self.device, &mut self.sockets);
        while let Some(packet) = self.device.outbound.pop_front() {
            self.encapsulate_and_send(&packet, scratch);
        }
    }
}

/// Destination address of a raw IP packet.
fn packet_dst(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => Some(IpAddr::V4(Ipv4Addr::new(
            packet[16], packet[17], packet[18], packet[19],
        ))),
        6 if packet.len() >= 40 => {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&packet[24..40]);
            Some(IpAddr::V6(Ipv6Addr::from(bytes)))
        }
        _ => None,
    }
}

fn ip_to_smoltcp(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(a) => IpAddress::Ipv4(a),
        IpAddr::V6(a) => IpAddress::Ipv6(a),
    }
}

fn endpoint_to_socket_addr(endpoint: IpEndpoint) -> SocketAddr {
    let ip = match endpoint.addr {
        IpAddress::Ipv4(a) => IpAddr::V4(a),
        IpAddress::Ipv6(a) => IpAddr::V6(a),
    };
    SocketAddr::new(ip, endpoint.port)
}

fn smoltcp_now() -> smoltcp::time::Instant {
    let millis = std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    smoltcp::time::Instant::from_millis(millis)
}

// In-memory packet device bridging smoltcp and the WireGuard sessions.
struct VirtualDevice {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    caps: DeviceCapabilities,
}

impl VirtualDevice {
    fn new(mtu: usize) -> Self {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = mtu;
        Self {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            caps,
        }
    }
}

struct VirtRxToken(Vec<u8>);

impl RxToken for VirtRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

struct VirtTxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl<'a> TxToken for VirtTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.0.push_back(buf);
        result
    }
}

impl smoltcp::phy::Device for VirtualDevice {
    type RxToken<'a> = VirtRxToken;
    type TxToken<'a> = VirtTxToken<'a>;

    fn receive(
        &mut self,
        _timestamp: smoltcp::time::Instant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        self.inbound
            .pop_front()
            .map(|pkt| (VirtRxToken(pkt), VirtTxToken(&mut self.outbound)))
    }

    fn transmit(&mut self, _timestamp: smoltcp::time::Instant) -> Option<Self::TxToken<'_>> {
        Some(VirtTxToken(&mut self.outbound))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.caps.clone()
    }
}
