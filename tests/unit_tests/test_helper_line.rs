use std::net::{IpAddr, Ipv4Addr};

use sockslink::{
    cfg::{config::NextHop, enums::AuthMethod},
    models::helper_line::{HelperReply, HelperRequest},
};

fn request(method: AuthMethod) -> HelperRequest {
    HelperRequest {
        source: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 7)),
        method,
        username: None,
        password: None,
    }
}

#[test]
fn test_request_encode_none() {
    let req = request(AuthMethod::None);
    assert_eq!(req.encode(), "192.168.0.7 none\n");
}

#[test]
fn test_request_encode_username_urlencodes() {
    let mut req = request(AuthMethod::Username);
    req.username = Some(b"us er".to_vec());
    req.password = Some(b"p:ss".to_vec());
    assert_eq!(req.encode(), "192.168.0.7 username us%20er p%3ass\n");
}

#[test]
fn test_request_encode_none_omits_credentials() {
    let mut req = request(AuthMethod::None);
    req.username = Some(b"user".to_vec());
    req.password = Some(b"pass".to_vec());
    assert_eq!(req.encode(), "192.168.0.7 none\n");
}

#[test]
fn test_parse_ok_explicit_next_hop() {
    let reply = HelperReply::parse("OK 10.0.0.1 1081 none").expect("parse failed");
    match reply {
        HelperReply::Ok(route) => {
            assert_eq!(
                route.next_hop,
                Some(NextHop {
                    host: "10.0.0.1".to_string(),
                    port: 1081
                })
            );
            assert_eq!(route.method, AuthMethod::None);
            assert_eq!(route.username, None);
        },
        other => panic!("expected OK, got {other:?}"),
    }
}

#[test]
fn test_parse_ok_default_next_hop() {
    let reply = HelperReply::parse("OK default 1080 none").expect("parse failed");
    match reply {
        HelperReply::Ok(route) => assert_eq!(route.next_hop, None),
        other => panic!("expected OK, got {other:?}"),
    }
}

#[test]
fn test_parse_ok_username_credentials() {
    let reply =
        HelperReply::parse("OK 10.0.0.1 1081 username us%20er p%3ass").expect("parse failed");
    match reply {
        HelperReply::Ok(route) => {
            assert_eq!(route.method, AuthMethod::Username);
            assert_eq!(route.username.as_deref(), Some(&b"us er"[..]));
            assert_eq!(route.password.as_deref(), Some(&b"p:ss"[..]));
        },
        other => panic!("expected OK, got {other:?}"),
    }
}

#[test]
fn test_parse_collapses_whitespace_runs() {
    let reply = HelperReply::parse("OK   10.0.0.1\t1081   none").expect("parse failed");
    match reply {
        HelperReply::Ok(route) => {
            assert_eq!(
                route.next_hop,
                Some(NextHop {
                    host: "10.0.0.1".to_string(),
                    port: 1081
                })
            );
        },
        other => panic!("expected OK, got {other:?}"),
    }
}

#[test]
fn test_parse_err_with_message() {
    let reply = HelperReply::parse("ERR bad%20password").expect("parse failed");
    assert_eq!(reply, HelperReply::Err(Some("bad password".to_string())));
}

#[test]
fn test_parse_err_without_message() {
    let reply = HelperReply::parse("ERR").expect("parse failed");
    assert_eq!(reply, HelperReply::Err(None));
}

#[test]
fn test_parse_rejects_unknown_discriminator() {
    assert!(HelperReply::parse("WAT 10.0.0.1 1081 none").is_err());
    assert!(HelperReply::parse("").is_err());
    // Discriminator match is exact, not a prefix.
    assert!(HelperReply::parse("OKAY 10.0.0.1 1081 none").is_err());
}

#[test]
fn test_parse_rejects_malformed_ok() {
    assert!(HelperReply::parse("OK").is_err());
    assert!(HelperReply::parse("OK 10.0.0.1").is_err());
    assert!(HelperReply::parse("OK 10.0.0.1 notaport none").is_err());
    assert!(HelperReply::parse("OK 10.0.0.1 1081").is_err());
    assert!(HelperReply::parse("OK 10.0.0.1 1081 gssapi").is_err());
    // "none" must not carry credentials, "username" must carry both.
    assert!(HelperReply::parse("OK 10.0.0.1 1081 none user pass").is_err());
    assert!(HelperReply::parse("OK 10.0.0.1 1081 username user").is_err());
}
