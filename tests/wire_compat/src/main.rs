fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use chatrelay_protocol::{
        Body, Envelope, ErrorCode, LoginRequest, LoginResponse, MessageType, SubType,
        UserListPayload, UserPresence,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn fixture_text(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        serde_json::from_str(&fixture_text(name))
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"))
    }

    /// Decodes a fixture as an envelope.
    fn load_envelope(name: &str) -> Envelope {
        Envelope::decode(fixture_text(name).as_bytes())
            .unwrap_or_else(|e| panic!("failed to decode {name}: {e}"))
    }

    /// Decodes a fixture, re-encodes it and compares the JSON values.
    fn roundtrip_test(name: &str) {
        let fixture = load_fixture(name);
        let encoded = load_envelope(name)
            .encode()
            .unwrap_or_else(|e| panic!("failed to re-encode {name}: {e}"));
        let reserialized: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  encoded: {reserialized}"
        );
    }

    /// Re-serializes a typed payload and compares it to the fixture's payload.
    fn payload_roundtrip<T>(name: &str)
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = load_envelope(name)
            .parse_payload()
            .unwrap_or_else(|e| panic!("failed to parse payload of {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed).unwrap();
        assert_eq!(fixture["payload"], reserialized, "payload mismatch for {name}");
    }

    #[test]
    fn all_fixtures_roundtrip() {
        let mut names: Vec<_> = fs::read_dir(fixtures_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".json"))
            .collect();
        names.sort();
        assert!(!names.is_empty());

        for name in &names {
            roundtrip_test(name);
        }
    }

    // --- Server-originated shapes ---

    #[test]
    fn fixture_login_request() {
        let env = load_envelope("login_request.json");
        assert_eq!(env.msg_type, MessageType::Auth);
        assert_eq!(env.sub_type, SubType::Login);
        assert_eq!(
            env.body().unwrap(),
            Body::Login(LoginRequest {
                nickname: "alice".into()
            })
        );
        payload_roundtrip::<LoginRequest>("login_request.json");
    }

    #[test]
    fn fixture_login_response_accepted() {
        payload_roundtrip::<LoginResponse>("login_response_accepted.json");
        let resp: LoginResponse = load_envelope("login_response_accepted.json")
            .parse_payload()
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.nickname.as_deref(), Some("alice"));
    }

    #[test]
    fn fixture_login_response_rejected() {
        payload_roundtrip::<LoginResponse>("login_response_rejected.json");
        let resp: LoginResponse = load_envelope("login_response_rejected.json")
            .parse_payload()
            .unwrap();
        assert!(!resp.success);
        assert!(resp.user_id.is_none());
    }

    #[test]
    fn fixture_userlist() {
        let env = load_envelope("userlist.json");
        assert_eq!(env.msg_type, MessageType::UserList);
        assert!(env.sub_type.is_none());
        payload_roundtrip::<UserListPayload>("userlist.json");

        let Body::UserList(list) = env.body().unwrap() else {
            panic!("expected user list body");
        };
        let names: Vec<_> = list.users.iter().map(|u| u.nickname.as_str()).collect();
        assert_eq!(names, ["alice", "bob"]);
    }

    #[test]
    fn fixture_presence() {
        payload_roundtrip::<UserPresence>("user_online.json");
        payload_roundtrip::<UserPresence>("user_offline.json");

        assert!(matches!(
            load_envelope("user_online.json").body().unwrap(),
            Body::UserOnline(p) if p.nickname == "bob"
        ));
        assert!(matches!(
            load_envelope("user_offline.json").body().unwrap(),
            Body::UserOffline(p) if p.nickname == "alice"
        ));
    }

    #[test]
    fn fixture_error() {
        let Body::Error(err) = load_envelope("error_not_authenticated.json").body().unwrap() else {
            panic!("expected error body");
        };
        assert_eq!(err.code, ErrorCode::NotAuthenticated);
    }

    #[test]
    fn fixture_heartbeat() {
        assert_eq!(load_envelope("heartbeat_ping.json").body().unwrap(), Body::Ping);
        assert_eq!(load_envelope("heartbeat_pong.json").body().unwrap(), Body::Pong);
    }

    // --- Relayed content ---

    #[test]
    fn fixture_text_message_passes_through() {
        let env = load_envelope("text_message.json");
        let Body::Relay(payload) = env.body().unwrap() else {
            panic!("expected relayed body");
        };
        assert_eq!(payload["text"], "hi");
        assert_eq!(env.to.len(), 1);
    }

    #[test]
    fn fixture_file_chunk_keeps_unknown_fields() {
        let fixture = load_fixture("file_chunk.json");
        let env = load_envelope("file_chunk.json");
        assert_eq!(env.sub_type, SubType::FileChunk);
        assert_eq!(env.group_id, "transfer-7");
        assert_eq!(serde_json::Value::Object(env.payload.clone()), fixture["payload"]);
    }
}
