//! Loopback integration: a fake client negotiates a session, receives a
//! fragmented keyframe, streams input events, then disconnects and a
//! second client takes its place.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use slatecast_core::config::PacingMode;
use slatecast_core::input::{InputEvent, InputEventType};
use slatecast_core::protocol::{
    frame_control_message, ConfigRequest, ControlMessageType, SessionProfile, VideoPacketHeader,
};
use slatecast_core::{CodecKind, EncodedFrame};
use slatecast_transport::{ControlEvent, ControlServer, InputReceiver, VideoSender};

fn profile(video_port: u16, input_port: u16) -> SessionProfile {
    SessionProfile {
        server_width: 1920,
        server_height: 1080,
        video_port,
        input_port,
        audio_port: 0,
        audio_sample_rate: 48_000,
        audio_channels: 2,
        audio_frame_ms: 10,
        codec_type: CodecKind::H264.wire_id(),
    }
}

async fn client_handshake(
    control_addr: std::net::SocketAddr,
    video_port: u16,
    input_port: u16,
) -> (TcpStream, SessionProfile) {
    let mut stream = TcpStream::connect(control_addr).await.unwrap();
    let request = ConfigRequest {
        client_width: 1080,
        client_height: 2340,
        video_port,
        input_port,
    };
    stream
        .write_all(&frame_control_message(ControlMessageType::ConfigRequest, &request.encode()))
        .await
        .unwrap();

    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(header[2], ControlMessageType::ConfigResponse as u8);
    let len = u16::from_be_bytes([header[0], header[1]]) as usize - 1;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();

    (stream, SessionProfile::decode(&payload).unwrap())
}

#[tokio::test]
async fn negotiate_stream_and_reconnect() {
    let control = ControlServer::bind(0, None).await.unwrap();
    let control_addr = control.local_addr().unwrap();

    let mut video = VideoSender::bind(0).await.unwrap();
    let input = InputReceiver::bind(0).await.unwrap();
    let input_addr = input.local_addr().unwrap();
    let (mut input_events, input_handle) = input.start();

    // Client-side receive socket for video datagrams.
    let client_video = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_video_port = client_video.local_addr().unwrap().port();

    let client = tokio::spawn(async move {
        let (control_stream, profile) =
            client_handshake(control_addr, client_video_port, input_addr.port()).await;
        assert_eq!(profile.server_width, 1920);
        assert_eq!(profile.codec_type, 2);
        assert_eq!(profile.audio_port, 0);

        // Stream stylus events on the input channel.
        let mut input_stream = TcpStream::connect(input_addr).await.unwrap();
        let event = InputEvent {
            kind: InputEventType::StylusDown,
            pointer_id: 0,
            x: 0.5,
            y: 0.5,
            pressure: 0.8,
            tilt_x: 0.0,
            tilt_y: 0.0,
            buttons: 0,
            timestamp_ms: 10,
        };
        input_stream.write_all(&event.encode()).await.unwrap();

        // Receive a fragmented keyframe.
        let mut buf = [0u8; 2048];
        let mut frame = Vec::new();
        let mut fragments = 0u16;
        loop {
            let (len, _) = client_video.recv_from(&mut buf).await.unwrap();
            let header = VideoPacketHeader::decode(&buf[..len]).unwrap();
            assert!(header.is_keyframe());
            assert_eq!(header.fragment_idx, fragments);
            frame.extend_from_slice(&buf[VideoPacketHeader::SIZE..len]);
            fragments += 1;
            if header.is_end_of_frame() {
                break;
            }
        }
        assert_eq!(fragments, 3);
        assert_eq!(frame.len(), 3000);

        drop(control_stream);
        event
    });

    // Server side: negotiate.
    let pending = control.accept().await.unwrap();
    let request = pending.request;
    let peer = pending.peer;
    let mut session = pending
        .send_profile(&profile(video.local_addr().unwrap().port(), input_addr.port()))
        .await
        .unwrap();

    video.set_client(
        std::net::SocketAddr::new(peer.ip(), request.video_port),
        PacingMode::None,
    );

    // First frame of the session is a keyframe.
    let keyframe = EncodedFrame {
        data: Bytes::from(vec![0xA5u8; 3000]),
        timestamp_us: 0,
        is_keyframe: true,
        codec: CodecKind::H264,
    };
    assert_eq!(video.send_frame(&keyframe, 0).await.unwrap(), 3);

    // The stylus event arrives on the input channel.
    let sent = client.await.unwrap();
    let got = input_events.recv().await.unwrap();
    assert_eq!(got, sent);

    // Control stream dropped by the client: the session reports it.
    let mut disconnected = false;
    for _ in 0..200 {
        match session.poll_event() {
            Some(ControlEvent::Disconnected) => {
                disconnected = true;
                break;
            }
            _ => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
        }
    }
    assert!(disconnected);

    // Teardown and accept a fresh client.
    session.close();
    video.clear_client();
    input_handle.reset();

    let second = tokio::spawn(async move {
        let (_stream, profile) = client_handshake(control_addr, 41000, 41001).await;
        profile
    });
    let pending = control.accept().await.unwrap();
    assert_eq!(pending.request.video_port, 41000);
    let session = pending
        .send_profile(&profile(video.local_addr().unwrap().port(), input_addr.port()))
        .await
        .unwrap();
    assert_eq!(second.await.unwrap().server_height, 1080);

    session.close();
    input_handle.shutdown();
}
