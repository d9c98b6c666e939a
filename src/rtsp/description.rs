//! Format selection from the DESCRIBE session description

use sdp_types as sdp;
use url::Url;

use crate::error::{AppError, Result};

/// Encoding name the relay forwards without transcoding
pub const H264_ENCODING: &str = "H264";

/// The one video stream the relay pulls from the source
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFormat {
    /// Payload type announced by the source
    pub payload_type: u8,
    pub clock_rate: u32,
    /// `a=fmtp` parameters without the leading payload type
    pub fmtp: Option<String>,
    /// Absolute URL for SETUP
    pub control: Url,
    /// Aggregate URL for PLAY: the session-level control, or the content base
    pub aggregate: Url,
}

/// Pick the first H.264 video stream out of `session`
pub fn find_h264_format(session: &sdp::Session, base: &Url) -> Result<VideoFormat> {
    let session_control = attribute(&session.attributes, "control");
    // A session-level control URL becomes the base for relative media controls
    let base = match session_control {
        Some(control) if control != "*" => resolve_control(base, Some(control))?,
        _ => base.clone(),
    };

    for media in session.medias.iter().filter(|m| m.media == "video") {
        let offered: Vec<u8> = media
            .fmt
            .split_whitespace()
            .filter_map(|pt| pt.parse().ok())
            .collect();

        for rtpmap in attributes(&media.attributes, "rtpmap") {
            let Some((payload_type, encoding, clock_rate)) = parse_rtpmap(rtpmap) else {
                continue;
            };
            if !encoding.eq_ignore_ascii_case(H264_ENCODING) || !offered.contains(&payload_type) {
                continue;
            }

            let fmtp = attributes(&media.attributes, "fmtp").find_map(|value| {
                let (pt, params) = value.split_once(' ')?;
                (pt.trim().parse::<u8>().ok()? == payload_type).then(|| params.trim().to_string())
            });
            let control = resolve_control(&base, attribute(&media.attributes, "control"))?;

            return Ok(VideoFormat {
                payload_type,
                clock_rate,
                fmtp,
                control,
                aggregate: base,
            });
        }
    }

    Err(AppError::Rtsp(
        "source does not offer an H264 video stream".to_string(),
    ))
}

/// Resolve a media `a=control` value against the content base
pub fn resolve_control(base: &Url, control: Option<&str>) -> Result<Url> {
    let control = match control.map(str::trim) {
        None | Some("") | Some("*") => return Ok(base.clone()),
        Some(control) => control,
    };

    if control
        .get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("rtsp://"))
    {
        return Url::parse(control)
            .map_err(|e| AppError::Rtsp(format!("invalid control URL {:?}: {}", control, e)));
    }

    let mut joined = base.as_str().trim_end_matches('/').to_string();
    joined.push('/');
    joined.push_str(control.trim_start_matches('/'));
    Url::parse(&joined).map_err(|e| AppError::Rtsp(format!("invalid control URL {:?}: {}", joined, e)))
}

fn attribute<'a>(attrs: &'a [sdp::Attribute], name: &'a str) -> Option<&'a str> {
    attributes(attrs, name).next()
}

fn attributes<'a>(attrs: &'a [sdp::Attribute], name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    attrs
        .iter()
        .filter(move |a| a.attribute.eq_ignore_ascii_case(name))
        .filter_map(|a| a.value.as_deref())
}

/// `96 H264/90000` -> (96, "H264", 90000)
fn parse_rtpmap(value: &str) -> Option<(u8, &str, u32)> {
    let (pt, rest) = value.trim().split_once(' ')?;
    let mut parts = rest.trim().split('/');
    let encoding = parts.next()?;
    let clock_rate = parts.next()?.parse().ok()?;
    Some((pt.parse().ok()?, encoding, clock_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(media: &str) -> sdp::Session {
        let text = format!(
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=Camera\r\nc=IN IP4 0.0.0.0\r\nt=0 0\r\n{}",
            media
        );
        sdp::Session::parse(text.as_bytes()).unwrap()
    }

    fn base() -> Url {
        Url::parse("rtsp://127.0.0.1:8900/live/").unwrap()
    }

    #[test]
    fn selects_h264_and_resolves_relative_control() {
        let sdp = session(
            "m=audio 0 RTP/AVP 0\r\na=control:trackID=1\r\n\
m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1;profile-level-id=42e01f\r\na=control:trackID=0\r\n",
        );
        let format = find_h264_format(&sdp, &base()).unwrap();
        assert_eq!(format.payload_type, 96);
        assert_eq!(format.clock_rate, 90000);
        assert_eq!(
            format.fmtp.as_deref(),
            Some("packetization-mode=1;profile-level-id=42e01f")
        );
        assert_eq!(format.control.as_str(), "rtsp://127.0.0.1:8900/live/trackID=0");
    }

    #[test]
    fn encoding_name_is_case_insensitive() {
        let sdp = session("m=video 0 RTP/AVP 97\r\na=rtpmap:97 h264/90000\r\n");
        let format = find_h264_format(&sdp, &base()).unwrap();
        assert_eq!(format.payload_type, 97);
        assert_eq!(format.control, base());
    }

    #[test]
    fn absolute_control_is_used_verbatim() {
        let sdp = session(
            "m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:rtsp://10.0.0.2/cam/track1\r\n",
        );
        let format = find_h264_format(&sdp, &base()).unwrap();
        assert_eq!(format.control.as_str(), "rtsp://10.0.0.2/cam/track1");
    }

    #[test]
    fn missing_h264_stream_is_an_error() {
        let sdp = session("m=video 0 RTP/AVP 98\r\na=rtpmap:98 H265/90000\r\n");
        assert!(matches!(find_h264_format(&sdp, &base()), Err(AppError::Rtsp(_))));

        let sdp = session("m=audio 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n");
        assert!(find_h264_format(&sdp, &base()).is_err());
    }

    #[test]
    fn resolve_control_handles_star_and_slashes() {
        let base = Url::parse("rtsp://cam.local/stream").unwrap();
        assert_eq!(resolve_control(&base, Some("*")).unwrap(), base);
        assert_eq!(resolve_control(&base, None).unwrap(), base);
        assert_eq!(
            resolve_control(&base, Some("/track1")).unwrap().as_str(),
            "rtsp://cam.local/stream/track1"
        );
    }

    #[test]
    fn non_ascii_control_is_joined_without_panicking() {
        let base = Url::parse("rtsp://cam.local/stream/").unwrap();
        let url = resolve_control(&base, Some("trackIé")).unwrap();
        assert!(url.as_str().starts_with("rtsp://cam.local/stream/track"));

        assert!(resolve_control(&base, Some("é")).is_ok());
        assert!(resolve_control(&base, Some("rtspé://x")).is_ok());
    }

    #[test]
    fn session_control_becomes_the_aggregate_url() {
        let sdp = session(
            "a=control:rtsp://10.0.0.2/cam/\r\n\
m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:track1\r\n",
        );
        let format = find_h264_format(&sdp, &base()).unwrap();
        assert_eq!(format.aggregate.as_str(), "rtsp://10.0.0.2/cam/");
        assert_eq!(format.control.as_str(), "rtsp://10.0.0.2/cam/track1");

        let sdp = session("a=control:*\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n");
        assert_eq!(find_h264_format(&sdp, &base()).unwrap().aggregate, base());
    }
}
