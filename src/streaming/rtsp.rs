//! RTSP/1.0 session management over TCP with UDP RTP/RTCP transport
//!
//! A session performs OPTIONS, DESCRIBE (SDP), SETUP (negotiating a local
//! RTP/RTCP UDP port pair), and PLAY, then keeps the server alive with
//! GET_PARAMETER at two thirds of the negotiated session timeout. Reader
//! tasks deliver RTP packets tagged with wall-clock timestamps derived from
//! RTCP sender reports (see [`WallClockMapper`]).
//!
//! Packets received before the first sender report are withheld up to a
//! grace window; once it elapses they are delivered with
//! `wall_clock_ns: None` and a missing-timestamp warning is logged once.

use super::wallclock::WallClockMapper;
use super::{RtpPacket, SenderReport};
use crate::config::StreamingConfig;
use crate::error::{Error, Result};
use bytes::Bytes;
use rtp_rs::RtpReader;
use sdp::SessionDescription;
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

const RTCP_PT_SENDER_REPORT: u8 = 200;

/// Media description extracted from the DESCRIBE SDP
#[derive(Debug, Clone)]
pub struct MediaInfo {
    /// RTP payload type
    pub payload_type: u8,
    /// Encoding name from `rtpmap` (e.g. `H264`, `com.pupillabs.gaze1`)
    pub encoding_name: String,
    /// RTP clock rate in Hz
    pub clock_rate: u32,
    /// Out-of-band H.264 parameter sets from `fmtp`, decoded
    pub sprop_parameter_sets: Vec<Bytes>,
}

/// Parse the first video or application media of an SDP body
pub(crate) fn parse_sdp(body: &str) -> Result<MediaInfo> {
    let session = SessionDescription::unmarshal(&mut Cursor::new(body))
        .map_err(|e| Error::Sdp(format!("unmarshal: {e}")))?;

    for media in &session.media_descriptions {
        let kind = media.media_name.media.as_str();
        if kind != "video" && kind != "application" {
            continue;
        }

        let rtpmap = media
            .attributes
            .iter()
            .find(|a| a.key == "rtpmap")
            .and_then(|a| a.value.as_deref())
            .ok_or_else(|| Error::Sdp("media has no rtpmap attribute".to_string()))?;

        // "96 com.pupillabs.gaze1/90000"
        let mut parts = rtpmap.split_whitespace();
        let payload_type: u8 = parts
            .next()
            .and_then(|pt| pt.parse().ok())
            .ok_or_else(|| Error::Sdp(format!("bad rtpmap payload type: {rtpmap}")))?;
        let encoding = parts
            .next()
            .ok_or_else(|| Error::Sdp(format!("bad rtpmap encoding: {rtpmap}")))?;
        let mut encoding_parts = encoding.split('/');
        let encoding_name = encoding_parts
            .next()
            .unwrap_or_default()
            .to_string();
        let clock_rate: u32 = encoding_parts
            .next()
            .and_then(|rate| rate.parse().ok())
            .ok_or_else(|| Error::Sdp(format!("bad rtpmap clock rate: {rtpmap}")))?;

        let fmtp = media
            .attributes
            .iter()
            .find(|a| a.key == "fmtp")
            .and_then(|a| a.value.as_deref());
        let sprop_parameter_sets = match fmtp.and_then(extract_sprop) {
            Some(value) => super::video::parse_sprop_parameter_sets(&value)?,
            None => Vec::new(),
        };

        return Ok(MediaInfo {
            payload_type,
            encoding_name,
            clock_rate,
            sprop_parameter_sets,
        });
    }

    Err(Error::Sdp(
        "SDP contains no video or application media".to_string(),
    ))
}

/// Pull `sprop-parameter-sets=` out of an fmtp attribute value
fn extract_sprop(fmtp: &str) -> Option<String> {
    // "96 packetization-mode=1;sprop-parameter-sets=Z0IA...,aM4...;profile-level-id=..."
    let params = fmtp.split_once(' ').map(|(_, p)| p).unwrap_or(fmtp);
    params
        .split(';')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("sprop-parameter-sets="))
        .map(str::to_string)
}

/// One parsed RTSP response
#[derive(Debug)]
pub(crate) struct RtspResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RtspResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Read one RTSP response (status line, headers, Content-Length body)
pub(crate) async fn read_response<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<RtspResponse> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(Error::Rtsp("connection closed".to_string()));
    }
    let status_line = line.trim_end();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("RTSP/") {
        return Err(Error::Rtsp(format!("bad status line: {status_line}")));
    }
    let status: u16 = parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::Rtsp(format!("bad status code in: {status_line}")))?;

    let mut headers = Vec::new();
    loop {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line).await? == 0 {
            return Err(Error::Rtsp("connection closed in headers".to_string()));
        }
        let header_line = header_line.trim_end();
        if header_line.is_empty() {
            break;
        }
        if let Some((key, value)) = header_line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).await?;
    }

    Ok(RtspResponse {
        status,
        headers,
        body,
    })
}

/// Parse `Session: <id>;timeout=<seconds>`
pub(crate) fn parse_session_header(value: &str) -> (String, Option<Duration>) {
    let mut parts = value.split(';');
    let id = parts.next().unwrap_or_default().trim().to_string();
    let timeout = parts
        .map(str::trim)
        .find_map(|p| p.strip_prefix("timeout="))
        .and_then(|seconds| seconds.parse::<u64>().ok())
        .map(Duration::from_secs);
    (id, timeout)
}

/// Parse `server_port=<rtp>-<rtcp>` out of a Transport header
pub(crate) fn parse_server_ports(transport: &str) -> Option<(u16, u16)> {
    let range = transport
        .split(';')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("server_port="))?;
    let (rtp, rtcp) = range.split_once('-')?;
    Some((rtp.trim().parse().ok()?, rtcp.trim().parse().ok()?))
}

/// Extract the first sender report from an RTCP compound datagram
pub(crate) fn parse_sender_report(datagram: &[u8]) -> Option<SenderReport> {
    let mut rest = datagram;
    while rest.len() >= 8 {
        if rest[0] >> 6 != 2 {
            return None;
        }
        let packet_type = rest[1];
        let length_words = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        let packet_len = (length_words + 1) * 4;
        if packet_len > rest.len() {
            return None;
        }
        if packet_type == RTCP_PT_SENDER_REPORT && packet_len >= 28 {
            let ntp_timestamp = u64::from_be_bytes(rest[8..16].try_into().unwrap());
            let rtp_timestamp = u32::from_be_bytes(rest[16..20].try_into().unwrap());
            return Some(SenderReport {
                rtp_timestamp,
                ntp_timestamp,
            });
        }
        rest = &rest[packet_len..];
    }
    None
}

/// RTSP control connection: request writer and response reader
struct RtspControl {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    url: String,
    cseq: u32,
    session_id: Option<String>,
    session_timeout: Option<Duration>,
    request_timeout: Duration,
}

impl RtspControl {
    fn new(stream: TcpStream, url: String, request_timeout: Duration) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            url,
            cseq: 0,
            session_id: None,
            session_timeout: None,
            request_timeout,
        }
    }

    async fn request(
        &mut self,
        method: &str,
        extra_headers: &[(&str, String)],
    ) -> Result<RtspResponse> {
        self.cseq += 1;
        let mut request = format!(
            "{method} {} RTSP/1.0\r\nCSeq: {}\r\nUser-Agent: pupil-realtime\r\n",
            self.url, self.cseq
        );
        if let Some(session_id) = &self.session_id {
            request.push_str(&format!("Session: {session_id}\r\n"));
        }
        for (key, value) in extra_headers {
            request.push_str(&format!("{key}: {value}\r\n"));
        }
        request.push_str("\r\n");

        debug!("RTSP {method} (CSeq {})", self.cseq);
        self.writer.write_all(request.as_bytes()).await?;

        let response = timeout(self.request_timeout, read_response(&mut self.reader))
            .await
            .map_err(|_| Error::Rtsp(format!("{method} timed out")))??;

        if !(200..300).contains(&response.status) {
            return Err(Error::Rtsp(format!(
                "{method} failed with status {}",
                response.status
            )));
        }
        if self.session_id.is_none() {
            if let Some(session) = response.header("Session") {
                let (id, timeout) = parse_session_header(session);
                self.session_id = Some(id);
                self.session_timeout = timeout;
            }
        }
        Ok(response)
    }
}

/// Bind a consecutive even/odd UDP port pair for RTP and RTCP
async fn bind_udp_pair() -> Result<(UdpSocket, UdpSocket, u16)> {
    for _ in 0..16 {
        let first = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let port = first.local_addr()?.port();
        if port % 2 != 0 || port == u16::MAX - 1 {
            continue;
        }
        match UdpSocket::bind(("0.0.0.0", port + 1)).await {
            Ok(second) => return Ok((first, second, port)),
            Err(_) => continue,
        }
    }
    Err(Error::Rtsp(
        "could not bind an RTP/RTCP UDP port pair".to_string(),
    ))
}

/// An established and playing RTSP session
///
/// Created by [`connect`](Self::connect); delivers packets through
/// [`next_packet`](Self::next_packet) until torn down or broken. Dropping
/// the session aborts its reader and keepalive tasks and releases the
/// sockets.
pub struct RtspSession {
    media: MediaInfo,
    packets_rx: mpsc::Receiver<RtpPacket>,
    sender_report_rx: watch::Receiver<Option<SenderReport>>,
    control: Arc<Mutex<RtspControl>>,
    tasks: Vec<JoinHandle<()>>,
    missing_timestamps: Arc<AtomicBool>,
}

impl RtspSession {
    /// Connect to an RTSP URL, negotiate transport, and start playback
    pub async fn connect(url: &str, config: &StreamingConfig) -> Result<Self> {
        let parsed = url::Url::parse(url).map_err(|e| Error::Rtsp(format!("bad url: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::Rtsp("url has no host".to_string()))?
            .to_string();
        let port = parsed.port().unwrap_or(554);

        let stream = timeout(
            config.request_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| Error::Rtsp(format!("connect to {host}:{port} timed out")))??;
        let mut control = RtspControl::new(stream, url.to_string(), config.request_timeout);

        control.request("OPTIONS", &[]).await?;
        let describe = control
            .request("DESCRIBE", &[("Accept", "application/sdp".to_string())])
            .await?;
        let media = parse_sdp(&String::from_utf8_lossy(&describe.body))?;
        debug!(
            "Described media: {} @ {} Hz",
            media.encoding_name, media.clock_rate
        );

        let (rtp_socket, rtcp_socket, rtp_port) = bind_udp_pair().await?;
        let transport = format!("RTP/AVP;unicast;client_port={}-{}", rtp_port, rtp_port + 1);
        let setup = control
            .request("SETUP", &[("Transport", transport)])
            .await?;

        // Hole-punch towards the server's ports so its packets pass NAT and
        // stateful firewalls.
        if let Some((server_rtp, server_rtcp)) =
            setup.header("Transport").and_then(parse_server_ports)
        {
            let _ = rtp_socket.send_to(&[0u8; 4], (host.as_str(), server_rtp)).await;
            let _ = rtcp_socket
                .send_to(&[0u8; 4], (host.as_str(), server_rtcp))
                .await;
        }

        control
            .request("PLAY", &[("Range", "npt=0.000-".to_string())])
            .await?;

        let session_timeout = control
            .session_timeout
            .unwrap_or(config.default_session_timeout);
        let keepalive_interval = (session_timeout * 2 / 3).min(config.max_keepalive_interval);

        let mapper = Arc::new(std::sync::Mutex::new(WallClockMapper::new(
            media.clock_rate,
        )));
        let sr_notify = Arc::new(Notify::new());
        let missing_timestamps = Arc::new(AtomicBool::new(false));
        let (packets_tx, packets_rx) = mpsc::channel(config.packet_channel_depth);
        let (sender_report_tx, sender_report_rx) = watch::channel(None);
        let control = Arc::new(Mutex::new(control));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(rtp_reader_task(
            rtp_socket,
            mapper.clone(),
            sr_notify.clone(),
            packets_tx,
            Instant::now() + config.sender_report_grace,
            missing_timestamps.clone(),
            config.packet_channel_depth,
        )));
        tasks.push(tokio::spawn(rtcp_reader_task(
            rtcp_socket,
            mapper,
            sr_notify,
            sender_report_tx,
        )));
        tasks.push(tokio::spawn(keepalive_task(
            control.clone(),
            keepalive_interval,
        )));

        Ok(Self {
            media,
            packets_rx,
            sender_report_rx,
            control,
            tasks,
            missing_timestamps,
        })
    }

    /// The media description negotiated for this session
    pub fn media(&self) -> &MediaInfo {
        &self.media
    }

    /// Latest RTCP sender report seen on this session, if any
    pub fn latest_sender_report(&self) -> Option<SenderReport> {
        *self.sender_report_rx.borrow()
    }

    /// Whether samples were delivered without wall-clock timestamps because
    /// no sender report arrived within the grace window
    pub fn missing_timestamps(&self) -> bool {
        self.missing_timestamps.load(Ordering::Relaxed)
    }

    /// Receive the next RTP packet; `None` once the session has terminated
    pub async fn next_packet(&mut self) -> Option<RtpPacket> {
        self.packets_rx.recv().await
    }

    /// Send TEARDOWN and release all tasks and sockets
    pub async fn teardown(mut self) -> Result<()> {
        // Stop the keepalive before taking the control connection.
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let mut control = self.control.lock().await;
        control.request("TEARDOWN", &[]).await?;
        Ok(())
    }
}

impl Drop for RtspSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn rtp_reader_task(
    socket: UdpSocket,
    mapper: Arc<std::sync::Mutex<WallClockMapper>>,
    sr_notify: Arc<Notify>,
    packets_tx: mpsc::Sender<RtpPacket>,
    grace_deadline: Instant,
    missing_timestamps: Arc<AtomicBool>,
    pending_depth: usize,
) {
    let mut buf = vec![0u8; 65_536];
    let mut pending: VecDeque<(u64, RtpPacket)> = VecDeque::new();
    let mut last_sequence: Option<u16> = None;
    let mut grace_elapsed = false;

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let len = match received {
                    Ok((len, _)) => len,
                    Err(e) => {
                        warn!("RTP socket error: {e}");
                        break;
                    }
                };
                let reader = match RtpReader::new(&buf[..len]) {
                    Ok(reader) => reader,
                    Err(e) => {
                        debug!("Dropping malformed RTP datagram: {e:?}");
                        continue;
                    }
                };

                let sequence = u16::from(reader.sequence_number());
                if let Some(last) = last_sequence {
                    let delta = sequence.wrapping_sub(last) as i16;
                    if delta <= 0 {
                        debug!("Dropping stale/duplicate RTP packet {sequence}");
                        continue;
                    }
                    if delta > 1 {
                        debug!("RTP sequence gap: {} packet(s) lost", delta - 1);
                    }
                }
                last_sequence = Some(sequence);

                let packet = RtpPacket {
                    payload: Bytes::copy_from_slice(reader.payload()),
                    timestamp: reader.timestamp(),
                    sequence_number: sequence,
                    marker: reader.mark(),
                    wall_clock_ns: None,
                };

                let (extended, anchored) = {
                    let mut mapper = mapper.lock().unwrap();
                    let extended = mapper.extend_timestamp(packet.timestamp);
                    (extended, mapper.is_anchored())
                };

                if anchored {
                    if !flush_pending(&mapper, &mut pending, &packets_tx, true).await {
                        break;
                    }
                    let wall = mapper.lock().unwrap().wall_clock_from_extended(extended);
                    let packet = RtpPacket { wall_clock_ns: wall, ..packet };
                    if packets_tx.send(packet).await.is_err() {
                        break;
                    }
                } else if !grace_elapsed {
                    pending.push_back((extended, packet));
                    if pending.len() > pending_depth {
                        pending.pop_front();
                    }
                } else {
                    if !missing_timestamps.swap(true, Ordering::Relaxed) {
                        warn!(
                            "No RTCP sender report within the grace window; delivering \
                             samples without wall-clock timestamps"
                        );
                    }
                    if !flush_pending(&mapper, &mut pending, &packets_tx, false).await {
                        break;
                    }
                    if packets_tx.send(packet).await.is_err() {
                        break;
                    }
                }
            }
            _ = sr_notify.notified() => {
                if !flush_pending(&mapper, &mut pending, &packets_tx, true).await {
                    break;
                }
            }
            _ = tokio::time::sleep_until(grace_deadline), if !grace_elapsed => {
                grace_elapsed = true;
                if !pending.is_empty() && !mapper.lock().unwrap().is_anchored() {
                    if !missing_timestamps.swap(true, Ordering::Relaxed) {
                        warn!(
                            "No RTCP sender report within the grace window; delivering \
                             samples without wall-clock timestamps"
                        );
                    }
                    if !flush_pending(&mapper, &mut pending, &packets_tx, false).await {
                        break;
                    }
                }
            }
        }
    }
}

/// Deliver withheld packets, mapping timestamps when `with_wall_clock`.
/// Returns `false` when the consumer is gone.
async fn flush_pending(
    mapper: &Arc<std::sync::Mutex<WallClockMapper>>,
    pending: &mut VecDeque<(u64, RtpPacket)>,
    packets_tx: &mpsc::Sender<RtpPacket>,
    with_wall_clock: bool,
) -> bool {
    while let Some((extended, packet)) = pending.pop_front() {
        let wall = if with_wall_clock {
            mapper.lock().unwrap().wall_clock_from_extended(extended)
        } else {
            None
        };
        let packet = RtpPacket {
            wall_clock_ns: wall,
            ..packet
        };
        if packets_tx.send(packet).await.is_err() {
            return false;
        }
    }
    true
}

async fn rtcp_reader_task(
    socket: UdpSocket,
    mapper: Arc<std::sync::Mutex<WallClockMapper>>,
    sr_notify: Arc<Notify>,
    sender_report_tx: watch::Sender<Option<SenderReport>>,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        let len = match socket.recv_from(&mut buf).await {
            Ok((len, _)) => len,
            Err(e) => {
                warn!("RTCP socket error: {e}");
                break;
            }
        };
        if let Some(report) = parse_sender_report(&buf[..len]) {
            debug!(
                "Sender report: rtp {} ntp {:#x}",
                report.rtp_timestamp, report.ntp_timestamp
            );
            mapper
                .lock()
                .unwrap()
                .observe_sender_report(report.rtp_timestamp, report.ntp_timestamp);
            let _ = sender_report_tx.send(Some(report));
            sr_notify.notify_one();
        }
    }
}

async fn keepalive_task(control: Arc<Mutex<RtspControl>>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let mut control = control.lock().await;
        if let Err(e) = control.request("GET_PARAMETER", &[]).await {
            warn!("RTSP keepalive failed: {e}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::wallclock::unix_ns_to_ntp;

    const SAMPLE_SDP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 192.168.1.21\r\n\
        s=Session streamed with GStreamer\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z0IAH5WoFAFuQA==,aM48gA==\r\n\
        a=control:stream=0\r\n";

    const GAZE_SDP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 192.168.1.21\r\n\
        s=gaze\r\n\
        t=0 0\r\n\
        m=application 0 RTP/AVP 96\r\n\
        a=rtpmap:96 com.pupillabs.gaze1/90000\r\n";

    #[test]
    fn test_parse_sdp_h264() {
        let media = parse_sdp(SAMPLE_SDP).unwrap();
        assert_eq!(media.payload_type, 96);
        assert_eq!(media.encoding_name, "H264");
        assert_eq!(media.clock_rate, 90_000);
        assert_eq!(media.sprop_parameter_sets.len(), 2);
    }

    #[test]
    fn test_parse_sdp_custom_encoding() {
        let media = parse_sdp(GAZE_SDP).unwrap();
        assert_eq!(media.encoding_name, "com.pupillabs.gaze1");
        assert!(media.sprop_parameter_sets.is_empty());
    }

    #[test]
    fn test_parse_sdp_without_media_fails() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=x\r\nt=0 0\r\n";
        assert!(matches!(parse_sdp(sdp), Err(Error::Sdp(_))));
    }

    #[test]
    fn test_extract_sprop() {
        assert_eq!(
            extract_sprop("96 packetization-mode=1;sprop-parameter-sets=AA==,BB==;x=y"),
            Some("AA==,BB==".to_string())
        );
        assert_eq!(extract_sprop("96 packetization-mode=1"), None);
    }

    #[test]
    fn test_parse_session_header() {
        let (id, timeout) = parse_session_header("12345678;timeout=60");
        assert_eq!(id, "12345678");
        assert_eq!(timeout, Some(Duration::from_secs(60)));

        let (id, timeout) = parse_session_header("ABCDEF");
        assert_eq!(id, "ABCDEF");
        assert_eq!(timeout, None);
    }

    #[test]
    fn test_parse_server_ports() {
        assert_eq!(
            parse_server_ports("RTP/AVP;unicast;client_port=5000-5001;server_port=6000-6001"),
            Some((6000, 6001))
        );
        assert_eq!(parse_server_ports("RTP/AVP;unicast"), None);
    }

    #[test]
    fn test_parse_sender_report() {
        let ntp = unix_ns_to_ntp(1_700_000_000_000_000_000);
        let mut datagram = Vec::new();
        datagram.push(0x80); // V=2, no padding, RC=0
        datagram.push(RTCP_PT_SENDER_REPORT);
        datagram.extend_from_slice(&6u16.to_be_bytes()); // length: 6 words follow
        datagram.extend_from_slice(&0x1234_5678u32.to_be_bytes()); // SSRC
        datagram.extend_from_slice(&ntp.to_be_bytes());
        datagram.extend_from_slice(&90_000u32.to_be_bytes()); // RTP timestamp
        datagram.extend_from_slice(&[0u8; 8]); // packet/octet counts

        let report = parse_sender_report(&datagram).unwrap();
        assert_eq!(report.rtp_timestamp, 90_000);
        assert_eq!(report.ntp_timestamp, ntp);
    }

    #[test]
    fn test_parse_sender_report_skips_receiver_report() {
        // A compound datagram: RR (PT 201) then SR.
        let mut datagram = Vec::new();
        datagram.push(0x80);
        datagram.push(201);
        datagram.extend_from_slice(&1u16.to_be_bytes());
        datagram.extend_from_slice(&[0u8; 4]);

        let ntp = unix_ns_to_ntp(1_700_000_000_000_000_000);
        datagram.push(0x80);
        datagram.push(RTCP_PT_SENDER_REPORT);
        datagram.extend_from_slice(&6u16.to_be_bytes());
        datagram.extend_from_slice(&0u32.to_be_bytes());
        datagram.extend_from_slice(&ntp.to_be_bytes());
        datagram.extend_from_slice(&1234u32.to_be_bytes());
        datagram.extend_from_slice(&[0u8; 8]);

        let report = parse_sender_report(&datagram).unwrap();
        assert_eq!(report.rtp_timestamp, 1234);
    }

    #[test]
    fn test_parse_sender_report_rejects_garbage() {
        assert!(parse_sender_report(&[0u8; 4]).is_none());
        assert!(parse_sender_report(&[0x40, 200, 0, 6]).is_none());
    }

    #[tokio::test]
    async fn test_read_response_with_body() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: 5\r\n\r\nhello";
        let mut reader = BufReader::new(&raw[..]);
        let response = read_response(&mut reader).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("cseq"), Some("2"));
        assert_eq!(response.body, b"hello");
    }

    #[tokio::test]
    async fn test_read_response_error_status() {
        let raw = b"RTSP/1.0 454 Session Not Found\r\nCSeq: 3\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let response = read_response(&mut reader).await.unwrap();
        assert_eq!(response.status, 454);
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn test_read_response_rejects_http() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_response(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_udp_pair_is_even_odd() {
        let (rtp, rtcp, port) = bind_udp_pair().await.unwrap();
        assert_eq!(port % 2, 0);
        assert_eq!(rtp.local_addr().unwrap().port(), port);
        assert_eq!(rtcp.local_addr().unwrap().port(), port + 1);
    }
}
