use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};

use time::macros::datetime;

use tls_posture_scan::aggregate::Aggregator;
use tls_posture_scan::output::{self, CSV_HEADER};
use tls_posture_scan::types::{
    Cipher, Endpoint, ProcessInfo, Report, ScanRecord, ScanResult, Status, Transcript,
};

fn ep(last: u8, port: u16) -> Endpoint {
    Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 1, 0, last)), port)
}

fn cipher(name: &str, iana: Option<&str>, strength: &str) -> Cipher {
    Cipher {
        name: name.into(),
        iana_name: iana.map(Into::into),
        strength: Some(strength.into()),
    }
}

fn tls_result(endpoint: Endpoint) -> ScanResult {
    let mut tls_versions = BTreeMap::new();
    tls_versions.insert(
        "TLSv1.2".to_string(),
        vec![
            cipher(
                "ECDHE-RSA-AES128-GCM-SHA256",
                Some("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"),
                "A",
            ),
            cipher("VENDOR-SUITE,WITH-COMMA", None, "C"),
        ],
    );
    tls_versions.insert(
        "TLSv1.3".to_string(),
        vec![cipher("TLS_AES_256_GCM_SHA384", Some("TLS_AES_256_GCM_SHA384"), "A")],
    );
    let record = ScanRecord {
        endpoint: endpoint.clone(),
        service_name: Some("https".into()),
        service_product: Some("nginx".into()),
        protocol: "tcp".into(),
        open_ports: vec![endpoint.port],
        tls_versions,
        cipher_preference: BTreeMap::new(),
        least_strength: Some("C".into()),
    };
    let port = endpoint.port;
    ScanResult::success(
        record,
        vec![ProcessInfo {
            port,
            pid: 2001,
            process_name: "nginx".into(),
        }],
    )
    .with_transcript(Transcript {
        command: format!("nmap -Pn -sV --script ssl-enum-ciphers -p {port} -oX - 10.1.0.1"),
        raw_output: "<nmaprun/>".into(),
    })
}

fn sample_report() -> Report {
    let mut agg = Aggregator::new(datetime!(2024-05-01 12:00 UTC));
    agg.insert(tls_result(ep(1, 443).with_pod("web", "web-0")));
    agg.insert(ScanResult::failure(
        ep(2, 8443),
        Status::Timeout,
        Some("probe exceeded 90s".into()),
    ));
    agg.insert(ScanResult::failure(ep(3, 22), Status::NoTlsDetected, None));
    agg.finalize_at(datetime!(2024-05-01 12:05 UTC)).clone()
}

fn json_points(report: &Report) -> BTreeSet<(String, u16, String, String)> {
    let mut out = BTreeSet::new();
    for r in &report.results {
        let Some(rec) = &r.record else { continue };
        for (version, ciphers) in &rec.tls_versions {
            for c in ciphers {
                out.insert((
                    r.endpoint.ip.to_string(),
                    r.endpoint.port,
                    version.clone(),
                    c.display_name().to_string(),
                ));
            }
        }
    }
    out
}

#[test]
fn json_and_csv_carry_the_same_data_points() {
    let report = sample_report();
    let dir = tempfile::tempdir().unwrap();
    let json_path = dir.path().join("report.json");
    let csv_path = dir.path().join("report.csv");
    output::write_json(&json_path, &report).unwrap();
    output::write_csv(&csv_path, &report).unwrap();

    let from_json: Report = serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
    assert_eq!(from_json.results.len(), 3);

    let mut rdr = csv::Reader::from_path(&csv_path).unwrap();
    let headers = rdr.headers().unwrap().clone();
    assert_eq!(headers.iter().collect::<Vec<_>>(), CSV_HEADER.to_vec());

    let mut from_csv = BTreeSet::new();
    for row in rdr.records() {
        let row = row.unwrap();
        if row[7].is_empty() || row[8].is_empty() {
            continue;
        }
        from_csv.insert((
            row[0].to_string(),
            row[1].parse::<u16>().unwrap(),
            row[7].to_string(),
            row[8].to_string(),
        ));
    }

    let expected = output::data_points(&report);
    assert_eq!(expected.len(), 3);
    assert_eq!(json_points(&from_json), expected);
    assert_eq!(from_csv, expected);
}

#[test]
fn csv_has_one_summary_row_per_failed_endpoint() {
    let report = sample_report();
    let mut buf = Vec::new();
    output::render_csv(&report, &mut buf).unwrap();

    let mut rdr = csv::Reader::from_reader(buf.as_slice());
    let rows: Vec<csv::StringRecord> = rdr.records().map(Result::unwrap).collect();
    // 3 cipher rows + 2 failure rows
    assert_eq!(rows.len(), 5);

    let timeout: Vec<_> = rows.iter().filter(|r| &r[4] == "timeout").collect();
    assert_eq!(timeout.len(), 1);
    assert_eq!(&timeout[0][1], "8443");
    assert_eq!(&timeout[0][7], "");
    assert_eq!(&timeout[0][12], "probe exceeded 90s");

    let plain: Vec<_> = rows.iter().filter(|r| &r[4] == "no_tls_detected").collect();
    assert_eq!(plain.len(), 1);
    assert_eq!(&plain[0][8], "");
}

#[test]
fn csv_success_rows_carry_pod_and_processes() {
    let report = sample_report();
    let mut buf = Vec::new();
    output::render_csv(&report, &mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();

    assert!(text.contains(
        "10.1.0.1,443,web,web-0,success,https,tcp,TLSv1.2,TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,ECDHE-RSA-AES128-GCM-SHA256,A,nginx(2001),"
    ));
    // Names with separators are quoted, not split.
    assert!(text.contains("\"VENDOR-SUITE,WITH-COMMA\",\"VENDOR-SUITE,WITH-COMMA\",C"));
}

#[test]
fn log_block_lists_command_output_and_findings() {
    let report = sample_report();
    let mut buf = Vec::new();
    output::render_log(&report, &mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();

    assert!(text.starts_with("scan started 2024-05-01T12:00:00Z finished 2024-05-01T12:05:00Z\n"));
    assert!(text.contains("=== 10.1.0.1:443 (web/web-0) ==="));
    assert!(text.contains("command: nmap -Pn -sV --script ssl-enum-ciphers -p 443"));
    assert!(text.contains("<nmaprun/>"));
    assert!(text.contains("TLSv1.3: 1 cipher(s)"));
    assert!(text.contains("processes: nginx(2001)"));

    assert!(text.contains("=== 10.1.0.2:8443 ==="));
    assert!(text.contains("command: (not run)"));
    assert!(text.contains("status: timeout"));
    assert!(text.contains("error: probe exceeded 90s"));
}

#[test]
fn cancelled_report_is_flagged_everywhere() {
    let mut agg = Aggregator::new(datetime!(2024-05-01 12:00 UTC));
    let pending = ep(9, 443);
    agg.expect([&pending]);
    agg.mark_cancelled();
    let report = agg.finalize_at(datetime!(2024-05-01 12:01 UTC)).clone();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["cancelled"], serde_json::Value::Bool(true));
    assert_eq!(json["results"][0]["status"], "cancelled");

    let mut log = Vec::new();
    output::render_log(&report, &mut log).unwrap();
    assert!(String::from_utf8(log).unwrap().lines().next().unwrap().ends_with("(cancelled)"));
}
