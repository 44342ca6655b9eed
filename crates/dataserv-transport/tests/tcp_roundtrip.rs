use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    thread,
    time::Duration,
};

use dataserv_transport::{
    Metadata,
    tcp::{PollEvent, SendBehavior, TcpConnector},
};

#[test]
fn tcp_roundtrip() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 24712));

    let mut listener = TcpConnector::default();
    let _listening_token = listener.listen_at(bind_addr).unwrap();

    let server = thread::spawn(move || {
        let mut accepted_stream = None;

        while accepted_stream.is_none() {
            listener.poll_with(|event| match event {
                PollEvent::Accept { stream, .. } => accepted_stream = Some(stream),
                PollEvent::Message { .. } => panic!("shouldn't have gotten here"),
                PollEvent::Disconnect { .. } => {}
            });
        }

        let stream_token = accepted_stream.unwrap();

        let mut recv = None;
        loop {
            listener.poll_with(|event| {
                if let PollEvent::Message { token, payload, metadata } = event {
                    assert_eq!(token, stream_token);
                    assert_eq!(metadata.tag(), 0xAB);
                    recv = Some(payload.to_vec());
                }
            });
            if recv.is_some() {
                break;
            }
            thread::sleep(Duration::from_micros(50));
        }
        listener.write_or_enqueue_with(SendBehavior::Single(stream_token), Metadata::from_tag(0xCD), |buf| {
            buf.extend_from_slice(b"pong");
        });
        listener.poll_with(|event| {
            if let PollEvent::Message { .. } = event {
                panic!("shouldn't have gotten here");
            }
        });
        assert_eq!(recv, Some(b"ping".to_vec()));
    });

    let client = thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut conn = TcpConnector::default();
        let tok = conn.connect(bind_addr).unwrap();
        conn.write_or_enqueue_with(SendBehavior::Single(tok), Metadata::from_tag(0xAB), |buf| {
            buf.extend_from_slice(b"ping");
        });

        let mut recv = None;
        loop {
            conn.poll_with(|event| {
                if let PollEvent::Message { payload, metadata, .. } = event {
                    assert_eq!(metadata.tag(), 0xCD);
                    recv = Some(payload.to_vec());
                }
            });
            if recv.is_some() {
                break;
            }
            thread::sleep(Duration::from_micros(50));
        }
        assert_eq!(recv, Some(b"pong".to_vec()));
    });

    server.join().unwrap();
    client.join().unwrap();
}
