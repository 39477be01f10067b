use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use tls_posture_scan::parser::{parse_probe_output, Findings};
use tls_posture_scan::types::Endpoint;

fn endpoint() -> Endpoint {
    Endpoint::new(IpAddr::V4(Ipv4Addr::new(172, 30, 0, 1)), 443)
}

/// Build an nmap-shaped report holding exactly `triples` (version, cipher, strength).
fn nmap_doc(triples: &[(&str, &str, Option<&str>)]) -> String {
    let mut versions: Vec<&str> = triples.iter().map(|t| t.0).collect();
    versions.dedup();
    let mut script = String::new();
    for v in &versions {
        script.push_str(&format!("<table key=\"{v}\"><table key=\"ciphers\">"));
        for (_, name, strength) in triples.iter().filter(|t| t.0 == *v) {
            script.push_str("<table>");
            script.push_str(&format!("<elem key=\"name\">{name}</elem>"));
            if let Some(s) = strength {
                script.push_str(&format!("<elem key=\"strength\">{s}</elem>"));
            }
            script.push_str("</table>");
        }
        script.push_str("</table></table>");
    }
    format!(
        r#"<?xml version="1.0"?><nmaprun scanner="nmap"><host><status state="up"/><ports>
<port protocol="tcp" portid="443"><state state="open"/><service name="https"/>
<script id="ssl-enum-ciphers" output="">{script}</script></port></ports></host></nmaprun>"#
    )
}

fn triples_of(findings: Findings) -> BTreeSet<(String, String, Option<String>)> {
    let Findings::Tls(rec) = findings else {
        panic!("expected TLS findings, got {findings:?}");
    };
    rec.tls_versions
        .into_iter()
        .flat_map(|(v, ciphers)| {
            ciphers
                .into_iter()
                .map(move |c| (v.clone(), c.name, c.strength))
        })
        .collect()
}

#[test]
fn recovers_exactly_the_reported_triples() {
    let cases: Vec<Vec<(&str, &str, Option<&str>)>> = vec![
        vec![("TLSv1.2", "ECDHE-RSA-AES128-GCM-SHA256", Some("A"))],
        vec![
            ("TLSv1.0", "TLS_RSA_WITH_3DES_EDE_CBC_SHA", Some("C")),
            ("TLSv1.0", "TLS_RSA_WITH_RC4_128_SHA", Some("F")),
            ("TLSv1.2", "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384", Some("A")),
            ("TLSv1.3", "TLS_AKE_WITH_AES_128_GCM_SHA256", Some("A")),
        ],
        vec![
            ("SSLv3", "RC4-MD5", Some("F")),
            ("TLSv1.2", "SOME-FUTURE-SUITE", None),
        ],
    ];
    for triples in cases {
        let doc = nmap_doc(&triples);
        let got = triples_of(parse_probe_output(&endpoint(), &doc).unwrap());
        let want: BTreeSet<(String, String, Option<String>)> = triples
            .iter()
            .map(|(v, n, s)| (v.to_string(), n.to_string(), s.map(str::to_string)))
            .collect();
        assert_eq!(got, want);
    }
}

#[test]
fn iana_name_only_when_known() {
    let doc = nmap_doc(&[
        ("TLSv1.2", "ECDHE-RSA-AES128-GCM-SHA256", Some("A")),
        ("TLSv1.2", "SOME-FUTURE-SUITE", Some("A")),
    ]);
    let Findings::Tls(rec) = parse_probe_output(&endpoint(), &doc).unwrap() else {
        panic!("expected TLS findings");
    };
    let v12 = &rec.tls_versions["TLSv1.2"];
    assert_eq!(
        v12[0].iana_name.as_deref(),
        Some("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256")
    );
    assert_eq!(v12[1].name, "SOME-FUTURE-SUITE");
    assert_eq!(v12[1].iana_name, None);
}

#[test]
fn prefers_the_endpoint_port() {
    let doc = r#"<nmaprun><host><ports>
        <port protocol="tcp" portid="80"><state state="open"/>
          <script id="ssl-enum-ciphers"><table key="TLSv1.0"><table key="ciphers"/></table></script></port>
        <port protocol="tcp" portid="443"><state state="open"/>
          <script id="ssl-enum-ciphers"><table key="TLSv1.3"><table key="ciphers"/></table></script></port>
        </ports></host></nmaprun>"#;
    let Findings::Tls(rec) = parse_probe_output(&endpoint(), doc).unwrap() else {
        panic!("expected TLS findings");
    };
    assert_eq!(rec.open_ports, vec![80, 443]);
    assert!(rec.tls_versions.contains_key("TLSv1.3"));
    assert!(!rec.tls_versions.contains_key("TLSv1.0"));
}

#[test]
fn hostile_input_never_panics() {
    let inputs = [
        "",
        "\u{0}\u{0}\u{0}",
        "<nmaprun>",
        "<nmaprun><host><ports><port portid=\"99999\"><state state=\"open\"/></port></ports></host></nmaprun>",
        "<nmaprun attr=\"unterminated></nmaprun>",
        "<nmaprun>&bogus;</nmaprun>",
        "<?xml version=\"1.0\"?>",
        "<nmaprun><host><ports><port portid=\"443\"><state state=\"open\"/><script id=\"ssl-enum-ciphers\"><table key=\"TLSv1.2\"><table key=\"ciphers\"><table><elem key=\"name\"></elem></table></table></table></script></port></ports></host></nmaprun>",
    ];
    for input in inputs {
        let _ = parse_probe_output(&endpoint(), input);
    }
    let deep = "<nmaprun>".to_string() + &"<t>".repeat(10_000);
    assert!(parse_probe_output(&endpoint(), &deep).is_err());
}
