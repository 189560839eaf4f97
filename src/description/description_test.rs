use super::*;

const SDP_TWO_MEDIAS: &[u8] = b"v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=Stream\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:trackID=0\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=control:trackID=1\r\n\
a=rtpmap:97 MPEG4-GENERIC/48000/2\r\n";

#[test]
fn test_unmarshal() {
    let desc = SessionDescription::unmarshal(SDP_TWO_MEDIAS).unwrap();
    assert_eq!(desc.title.as_deref(), Some("Stream"));
    assert_eq!(desc.medias.len(), 2);

    let video = &desc.medias[0];
    assert_eq!(video.media_type, MediaType::Video);
    assert_eq!(video.control, "trackID=0");
    assert!(!video.is_back_channel);
    assert_eq!(
        video.formats,
        vec![Format {
            payload_type: 96,
            codec: "H264".into(),
            clock_rate: 90000,
            channels: None,
            parameters: "packetization-mode=1".into(),
        }]
    );

    let audio = &desc.medias[1];
    assert_eq!(audio.media_type, MediaType::Audio);
    assert_eq!(audio.formats[0].clock_rate, 48000);
    assert_eq!(audio.formats[0].channels, Some(2));
}

#[test]
fn test_unmarshal_static_payload_type() {
    let body = b"v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s= \r\n\
t=0 0\r\n\
m=audio 0 RTP/AVP 0\r\n\
a=control:trackID=0\r\n";

    let desc = SessionDescription::unmarshal(body).unwrap();
    assert_eq!(desc.title, None);
    assert_eq!(desc.medias[0].formats[0].codec, "PCMU");
    assert_eq!(desc.medias[0].formats[0].clock_rate, 8000);
}

#[test]
fn test_unmarshal_back_channel() {
    let body = b"v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s= \r\n\
t=0 0\r\n\
m=audio 0 RTP/AVP 8\r\n\
a=control:trackID=0\r\n\
a=sendonly\r\n";

    let desc = SessionDescription::unmarshal(body).unwrap();
    assert!(desc.medias[0].is_back_channel);
}

#[test]
fn test_marshal_round_trip() {
    let desc = SessionDescription::unmarshal(SDP_TWO_MEDIAS).unwrap();
    let enc = desc.marshal(false);
    let desc2 = SessionDescription::unmarshal(&enc).unwrap();
    assert_eq!(desc, desc2);
}

#[test]
fn test_marshal_secure_profile() {
    let desc = SessionDescription::unmarshal(SDP_TWO_MEDIAS).unwrap();
    let enc = String::from_utf8(desc.marshal(true)).unwrap();
    assert!(enc.contains("m=video 0 RTP/SAVP 96"));
}

#[test]
fn test_find_media_by_url_gstreamer() {
    let desc = SessionDescription::unmarshal(SDP_TWO_MEDIAS).unwrap();

    let u = RtspUrl::parse("rtsp://host/mypath/trackID=1").unwrap();
    assert_eq!(desc.find_media_by_url("mypath", &u), Some(1));

    let u = RtspUrl::parse("rtsp://host/otherpath/trackID=1").unwrap();
    assert_eq!(desc.find_media_by_url("mypath", &u), None);
}

#[test]
fn test_find_media_by_url_ffmpeg() {
    let body = b"v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s= \r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:streamid=0\r\n\
a=rtpmap:96 H264/90000\r\n";
    let desc = SessionDescription::unmarshal(body).unwrap();

    // control appended after the announced query
    let u = RtspUrl::parse("rtsp://host/mypath?key=val/streamid=0").unwrap();
    assert_eq!(desc.find_media_by_url("mypath?key=val", &u), Some(0));
}

#[test]
fn test_find_media_by_url_absolute() {
    let body = b"v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s= \r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:rtsp://host/mypath/trackID=5\r\n\
a=rtpmap:96 H264/90000\r\n";
    let desc = SessionDescription::unmarshal(body).unwrap();

    let u = RtspUrl::parse("rtsp://host/mypath/trackID=5").unwrap();
    assert_eq!(desc.find_media_by_url("mypath", &u), Some(0));
}
