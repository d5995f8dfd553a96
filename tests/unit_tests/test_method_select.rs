use bytes::BytesMut;
use sockslink::{
    cfg::enums::AuthMethod,
    models::{
        common::{AUTH_METHOD_INVALID, DecodeError},
        method_select::{MethodSelect, choose_method},
    },
};

#[test]
fn test_decode_waits_for_full_record() {
    let mut buf = BytesMut::new();
    assert_eq!(MethodSelect::decode(&mut buf), Ok(None));

    buf.extend_from_slice(&[0x05]);
    assert_eq!(MethodSelect::decode(&mut buf), Ok(None));
    assert_eq!(buf.len(), 1, "short reads must not consume bytes");

    buf.extend_from_slice(&[0x02, 0x00]);
    assert_eq!(MethodSelect::decode(&mut buf), Ok(None));

    buf.extend_from_slice(&[0x02]);
    let select = MethodSelect::decode(&mut buf)
        .expect("decode failed")
        .expect("record should be complete");
    assert_eq!(select.methods, vec![0x00, 0x02]);
    assert!(buf.is_empty());
}

#[test]
fn test_decode_preserves_pipelined_bytes() {
    let mut buf = BytesMut::from(&[0x05, 0x01, 0x00, b'h', b'i'][..]);
    let select = MethodSelect::decode(&mut buf)
        .expect("decode failed")
        .expect("record should be complete");
    assert_eq!(select.methods, vec![0x00]);
    assert_eq!(&buf[..], b"hi");
}

#[test]
fn test_decode_rejects_bad_version() {
    let mut buf = BytesMut::from(&[0x04, 0x01, 0x00][..]);
    assert_eq!(
        MethodSelect::decode(&mut buf),
        Err(DecodeError::BadSocksVersion(0x04))
    );
}

#[test]
fn test_zero_methods_record() {
    let mut buf = BytesMut::from(&[0x05, 0x00][..]);
    let select = MethodSelect::decode(&mut buf)
        .expect("decode failed")
        .expect("record should be complete");
    assert!(select.methods.is_empty());
}

#[test]
fn test_choose_method_preference_order() {
    let prefs = [AuthMethod::Username, AuthMethod::None];
    // Client offers both; the server's first preference wins.
    assert_eq!(choose_method(&prefs, &[0x00, 0x02]), Some(AuthMethod::Username));

    let prefs = [AuthMethod::None, AuthMethod::Username];
    assert_eq!(choose_method(&prefs, &[0x00, 0x02]), Some(AuthMethod::None));

    // No intersection.
    assert_eq!(choose_method(&prefs, &[0x01]), None);
    assert_eq!(choose_method(&[], &[0x00]), None);
}

#[test]
fn test_reply_and_offer_layout() {
    assert_eq!(MethodSelect::encode_reply(0x02), [0x05, 0x02]);
    assert_eq!(MethodSelect::encode_reply(AUTH_METHOD_INVALID), [0x05, 0xFF]);
    assert_eq!(MethodSelect::encode_offer(0x00), [0x05, 0x01, 0x00]);
}

#[test]
fn test_parse_reply() {
    assert_eq!(MethodSelect::parse_reply([0x05, 0x00]), Ok(0x00));
    assert_eq!(
        MethodSelect::parse_reply([0x04, 0x00]),
        Err(DecodeError::BadSocksVersion(0x04))
    );
}
