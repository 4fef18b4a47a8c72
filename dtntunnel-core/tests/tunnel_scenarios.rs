use anyhow::Result;
use dtntunnel_core::control::{TunnelConfig, TunnelSpec};
use dtntunnel_core::coordinator::{Coordinator, TransportHandles};
use dtntunnel_core::eid_table::DestinationResolver;
use dtntunnel_core::proto::{frame, split_bundle, BundleHeader, Protocol};
use dtntunnel_core::transport::memory::{MemoryNetwork, MemoryTransport};
use dtntunnel_core::transport::{BundleOptions, BundleTransport, EndpointId};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout, Instant};

const WAIT: Duration = Duration::from_secs(5);

/// A bare transport endpoint playing the far tunnel
struct FarEnd {
    transport: MemoryTransport,
    eid: EndpointId,
}

impl FarEnd {
    async fn attach(net: &MemoryNetwork) -> Result<Self> {
        let transport = net.attach("far");
        let eid = transport.build_local_eid("dtntunnel");
        transport.register(&eid).await?;
        Ok(Self { transport, eid })
    }

    async fn send(&self, to: &EndpointId, header: &BundleHeader, body: &[u8]) -> Result<()> {
        self.transport
            .send(&self.eid, to, &BundleOptions::default(), &frame(header, body))
            .await?;
        Ok(())
    }

    async fn next(&self) -> Result<(BundleHeader, Vec<u8>)> {
        let got = timeout(WAIT, self.transport.recv()).await??;
        let (header, body) = split_bundle(&got.payload)?;
        Ok((header, body.to_vec()))
    }

    /// Bundles up to and including the first one flagged eof
    async fn until_eof(&self) -> Result<Vec<(BundleHeader, Vec<u8>)>> {
        let mut out = Vec::new();
        loop {
            let (header, body) = self.next().await?;
            out.push((header, body));
            if header.eof {
                return Ok(out);
            }
        }
    }

    /// True if nothing arrives within `quiet`
    async fn is_quiet(&self, quiet: Duration) -> bool {
        timeout(quiet, self.transport.recv()).await.is_err()
    }
}

async fn start_tunnel(
    net: &MemoryNetwork,
    node: &str,
    cfg: TunnelConfig,
    resolver: DestinationResolver,
) -> Result<Arc<Coordinator>> {
    let transport = Arc::new(net.attach(node));
    let eid = transport.build_local_eid("dtntunnel");
    transport.register(&eid).await?;
    let coord = Coordinator::new(&cfg, eid, resolver, TransportHandles::shared(transport));
    let receiver = coord.clone();
    tokio::spawn(async move { receiver.run_receive_loop().await });
    Ok(coord)
}

async fn eventually(mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + WAIT;
    while !check() {
        if Instant::now() > deadline {
            anyhow::bail!("condition not reached within {WAIT:?}");
        }
        sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => panic!("expected an IPv4 address"),
    }
}

fn client_addr() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), 5555)
}

fn loopback_spec() -> TunnelSpec {
    TunnelSpec {
        local: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
        remote: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9),
    }
}

fn listen_config(protocol: Protocol) -> TunnelConfig {
    TunnelConfig {
        listen: true,
        protocol,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_small_writes_coalesce_into_one_bundle() -> Result<()> {
    let net = MemoryNetwork::new();
    let far = FarEnd::attach(&net).await?;
    let cfg = TunnelConfig {
        delay: Some(Duration::from_millis(50)),
        max_size: 1024,
        ..Default::default()
    };
    let coord = start_tunnel(&net, "a", cfg, DestinationResolver::fixed(far.eid.clone())).await?;
    let task = coord.start_listener(loopback_spec())?;

    let mut client = TcpStream::connect(task.local_addr).await?;
    client.write_all(b"A").await?;
    client.write_all(b"B").await?;
    client.write_all(b"C").await?;

    let (header, body) = far.next().await?;
    assert_eq!(header.protocol, Protocol::Tcp);
    assert_eq!(header.seqno, 0);
    assert!(!header.eof);
    assert_eq!(body, b"ABC");
    assert_eq!(header.remote, loopback_spec().remote);
    assert!(far.is_quiet(Duration::from_millis(150)).await);

    coord.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_full_bundle_flushes_before_delay() -> Result<()> {
    let net = MemoryNetwork::new();
    let far = FarEnd::attach(&net).await?;
    let max_size = 64;
    let cfg = TunnelConfig {
        delay: Some(Duration::from_secs(10)),
        max_size,
        ..Default::default()
    };
    let coord = start_tunnel(&net, "a2", cfg, DestinationResolver::fixed(far.eid.clone())).await?;
    let task = coord.start_listener(loopback_spec())?;

    let mut client = TcpStream::connect(task.local_addr).await?;
    let data = vec![b'x'; max_size - BundleHeader::SIZE];
    client.write_all(&data).await?;

    let (header, body) = timeout(Duration::from_secs(2), far.next()).await??;
    assert_eq!(header.seqno, 0);
    assert!(!header.eof);
    assert_eq!(body, data);

    coord.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_out_of_order_bundles_reach_server_in_order() -> Result<()> {
    let net = MemoryNetwork::new();
    let far = FarEnd::attach(&net).await?;
    let coord = start_tunnel(
        &net,
        "b",
        listen_config(Protocol::Tcp),
        DestinationResolver::default(),
    )
    .await?;
    let server = TcpListener::bind("127.0.0.1:0").await?;
    let remote = v4(server.local_addr()?);

    let header = BundleHeader::new(Protocol::Tcp, 7, client_addr(), remote);
    for seq in [2u32, 0, 1] {
        let body = seq.to_string();
        far.send(coord.local_eid(), &header.with_seqno(seq), body.as_bytes())
            .await?;
    }

    let (mut conn, _) = timeout(WAIT, server.accept()).await??;
    let mut got = [0u8; 3];
    timeout(WAIT, conn.read_exact(&mut got)).await??;
    assert_eq!(&got, b"012");
    assert_eq!(coord.tcp().table().len(), 1);
    assert_eq!(coord.tcp().table().orphan_count(), 0);

    coord.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_eof_handshake_closes_both_sides() -> Result<()> {
    let net = MemoryNetwork::new();
    let far = FarEnd::attach(&net).await?;
    let coord = start_tunnel(
        &net,
        "c",
        listen_config(Protocol::Tcp),
        DestinationResolver::default(),
    )
    .await?;
    let server = TcpListener::bind("127.0.0.1:0").await?;
    let remote = v4(server.local_addr()?);
    let header = BundleHeader::new(Protocol::Tcp, 3, client_addr(), remote);

    far.send(coord.local_eid(), &header, b"hi").await?;
    let (mut conn, _) = timeout(WAIT, server.accept()).await??;
    let mut got = [0u8; 2];
    timeout(WAIT, conn.read_exact(&mut got)).await??;
    assert_eq!(&got, b"hi");

    // Server answers and half-closes; the tunnel forwards data then eof
    conn.write_all(b"yo").await?;
    conn.shutdown().await?;
    let bundles = far.until_eof().await?;
    let seqs: Vec<u32> = bundles.iter().map(|(h, _)| h.seqno).collect();
    let expected: Vec<u32> = (0..bundles.len() as u32).collect();
    assert_eq!(seqs, expected);
    let data: Vec<u8> = bundles.iter().flat_map(|(_, b)| b.clone()).collect();
    assert_eq!(data, b"yo");
    assert!(bundles.iter().all(|(h, _)| h.connection_id == 3));

    // Our eof lets the tunnel close the server socket and forget the flow
    let mut eof = header.with_seqno(1);
    eof.eof = true;
    far.send(coord.local_eid(), &eof, b"").await?;

    let mut rest = Vec::new();
    timeout(WAIT, conn.read_to_end(&mut rest)).await??;
    assert!(rest.is_empty());
    eventually(|| coord.tcp().table().is_empty()).await?;
    assert!(far.is_quiet(Duration::from_millis(100)).await);

    coord.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_udp_without_reordering_forwards_in_arrival_order() -> Result<()> {
    let net = MemoryNetwork::new();
    let far = FarEnd::attach(&net).await?;
    let coord = start_tunnel(
        &net,
        "d",
        listen_config(Protocol::Udp),
        DestinationResolver::default(),
    )
    .await?;
    let server = UdpSocket::bind("127.0.0.1:0").await?;
    let remote = v4(server.local_addr()?);

    let header = BundleHeader::new(Protocol::Udp, 1, client_addr(), remote);
    for seq in [2u32, 0, 1] {
        far.send(coord.local_eid(), &header.with_seqno(seq), seq.to_string().as_bytes())
            .await?;
    }

    let mut buf = [0u8; 16];
    let mut order = Vec::new();
    for _ in 0..3 {
        let n = timeout(WAIT, server.recv(&mut buf)).await??;
        order.push(String::from_utf8_lossy(&buf[..n]).into_owned());
    }
    assert_eq!(order, ["2", "0", "1"]);

    coord.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_udp_reordering_restores_sequence() -> Result<()> {
    let net = MemoryNetwork::new();
    let far = FarEnd::attach(&net).await?;
    let cfg = TunnelConfig {
        reorder_udp: true,
        ..listen_config(Protocol::Udp)
    };
    let coord = start_tunnel(&net, "d2", cfg, DestinationResolver::default()).await?;
    let server = UdpSocket::bind("127.0.0.1:0").await?;
    let remote = v4(server.local_addr()?);

    let header = BundleHeader::new(Protocol::Udp, 1, client_addr(), remote);
    for seq in [2u32, 0, 1] {
        far.send(coord.local_eid(), &header.with_seqno(seq), seq.to_string().as_bytes())
            .await?;
    }

    let mut buf = [0u8; 16];
    let mut order = Vec::new();
    let mut forwarder = None;
    for _ in 0..3 {
        let (n, from) = timeout(WAIT, server.recv_from(&mut buf)).await??;
        order.push(String::from_utf8_lossy(&buf[..n]).into_owned());
        forwarder = Some(from);
    }
    assert_eq!(order, ["0", "1", "2"]);

    // Replies travel back with their own sequence
    let forwarder = forwarder.ok_or_else(|| anyhow::anyhow!("no datagram received"))?;
    server.send_to(b"pong", forwarder).await?;
    let (reply, body) = far.next().await?;
    assert_eq!(reply.protocol, Protocol::Udp);
    assert_eq!(reply.seqno, 0);
    assert_eq!(reply.client, client_addr());
    assert_eq!(body, b"pong");

    coord.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_backpressure_is_retried_without_loss_or_duplication() -> Result<()> {
    let net = MemoryNetwork::new();
    let far = FarEnd::attach(&net).await?;
    let cfg = TunnelConfig {
        backpressure_retry: Duration::from_millis(10),
        ..Default::default()
    };
    let coord = start_tunnel(&net, "e", cfg, DestinationResolver::fixed(far.eid.clone())).await?;
    let task = coord.start_listener(loopback_spec())?;

    net.fail_next_sends(3);
    let mut client = TcpStream::connect(task.local_addr).await?;
    client.write_all(b"data").await?;

    let (header, body) = far.next().await?;
    assert_eq!(header.seqno, 0);
    assert_eq!(body, b"data");
    assert_eq!(net.pending_forced_failures(), 0);
    assert!(far.is_quiet(Duration::from_millis(100)).await);

    // The sequence carries on from the one successful send
    drop(client);
    let (header, body) = far.next().await?;
    assert_eq!(header.seqno, 1);
    assert!(header.eof);
    assert!(body.is_empty());

    coord.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_duplicate_bundles_are_written_once() -> Result<()> {
    let net = MemoryNetwork::new();
    let far = FarEnd::attach(&net).await?;
    let coord = start_tunnel(
        &net,
        "f",
        listen_config(Protocol::Tcp),
        DestinationResolver::default(),
    )
    .await?;
    let server = TcpListener::bind("127.0.0.1:0").await?;
    let remote = v4(server.local_addr()?);
    let header = BundleHeader::new(Protocol::Tcp, 9, client_addr(), remote);

    for (seq, body) in [(0u32, "a"), (1, "b"), (1, "b"), (0, "a"), (2, "c")] {
        far.send(coord.local_eid(), &header.with_seqno(seq), body.as_bytes())
            .await?;
    }
    let mut eof = header.with_seqno(3);
    eof.eof = true;
    far.send(coord.local_eid(), &eof, b"").await?;

    let (mut conn, _) = timeout(WAIT, server.accept()).await??;
    let mut got = Vec::new();
    timeout(WAIT, conn.read_to_end(&mut got)).await??;
    assert_eq!(got, b"abc");

    coord.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_failed_remote_connect_replies_with_eof() -> Result<()> {
    let net = MemoryNetwork::new();
    let far = FarEnd::attach(&net).await?;
    let coord = start_tunnel(
        &net,
        "g",
        listen_config(Protocol::Tcp),
        DestinationResolver::default(),
    )
    .await?;

    // Grab a port nobody listens on
    let closed = {
        let l = TcpListener::bind("127.0.0.1:0").await?;
        v4(l.local_addr()?)
    };
    let header = BundleHeader::new(Protocol::Tcp, 11, client_addr(), closed);
    far.send(coord.local_eid(), &header, b"hello").await?;

    let (reply, body) = far.next().await?;
    assert!(reply.eof);
    assert_eq!(reply.seqno, 0);
    assert_eq!(reply.connection_id, 11);
    assert!(body.is_empty());
    eventually(|| coord.tcp().table().is_empty()).await?;

    coord.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_bundles_without_opener_wait_as_orphans() -> Result<()> {
    let net = MemoryNetwork::new();
    let far = FarEnd::attach(&net).await?;
    let coord = start_tunnel(
        &net,
        "h",
        listen_config(Protocol::Tcp),
        DestinationResolver::default(),
    )
    .await?;
    let header = BundleHeader::new(Protocol::Tcp, 4, client_addr(), loopback_spec().remote);

    far.send(coord.local_eid(), &header.with_seqno(1), b"x")
        .await?;
    far.send(coord.local_eid(), &header.with_seqno(2), b"y")
        .await?;
    eventually(|| coord.tcp().table().orphan_count() == 2).await?;
    assert!(coord.tcp().table().is_empty());
    assert!(coord.stats().total_bundles() >= 2);

    coord.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_stalled_flow_does_not_block_other_flows() -> Result<()> {
    let net = MemoryNetwork::new();
    let far = FarEnd::attach(&net).await?;
    let cfg = TunnelConfig {
        delivery_queue_depth: 4,
        recv_bufsize: 4096,
        send_bufsize: 4096,
        ..listen_config(Protocol::Tcp)
    };
    let coord = start_tunnel(&net, "i", cfg, DestinationResolver::default()).await?;

    // Flow A's server never reads, so its socket and queue fill up
    let stalled = TcpSocket::new_v4()?;
    stalled.set_recv_buffer_size(4096)?;
    stalled.bind("127.0.0.1:0".parse()?)?;
    let stalled = stalled.listen(16)?;
    let stalled_addr = v4(stalled.local_addr()?);
    let chunk = vec![0u8; 30 * 1024];
    let a = BundleHeader::new(Protocol::Tcp, 1, client_addr(), stalled_addr);
    for seq in 0..200u32 {
        far.send(coord.local_eid(), &a.with_seqno(seq), &chunk)
            .await?;
    }

    // Flow B still gets through
    let server = TcpListener::bind("127.0.0.1:0").await?;
    let b = BundleHeader::new(Protocol::Tcp, 2, client_addr(), v4(server.local_addr()?));
    far.send(coord.local_eid(), &b, b"hi").await?;

    let (mut conn, _) = timeout(WAIT, server.accept()).await??;
    let mut got = [0u8; 2];
    timeout(WAIT, conn.read_exact(&mut got)).await??;
    assert_eq!(&got, b"hi");

    // The stalled flow was torn down rather than left holding the receive path
    eventually(|| coord.tcp().table().len() == 1).await?;

    drop(stalled);
    coord.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_idle_udp_flow_is_reclaimed() -> Result<()> {
    let net = MemoryNetwork::new();
    let far = FarEnd::attach(&net).await?;
    let cfg = TunnelConfig {
        udp_idle_timeout: Duration::from_millis(200),
        ..listen_config(Protocol::Udp)
    };
    let coord = start_tunnel(&net, "j", cfg, DestinationResolver::default()).await?;
    let server = UdpSocket::bind("127.0.0.1:0").await?;
    let header = BundleHeader::new(Protocol::Udp, 5, client_addr(), v4(server.local_addr()?));

    let mut buf = [0u8; 16];
    far.send(coord.local_eid(), &header, b"one").await?;
    let n = timeout(WAIT, server.recv(&mut buf)).await??;
    assert_eq!(&buf[..n], b"one");
    assert_eq!(coord.udp().table().len(), 1);

    eventually(|| coord.udp().table().is_empty()).await?;

    // Traffic after the reclaim opens a fresh flow
    far.send(coord.local_eid(), &header.with_seqno(1), b"two")
        .await?;
    let n = timeout(WAIT, server.recv(&mut buf)).await??;
    assert_eq!(&buf[..n], b"two");

    coord.shutdown();
    Ok(())
}
