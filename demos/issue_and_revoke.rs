use ca_keeper::{Pki, PkiConfig, SubjectTemplate};
use std::fs;
use tracing_subscriber::EnvFilter;

/// Keeps a pki in ./pki, issues a server and a client certificate,
/// writes them to ./certs and revokes the client certificate.
/// Run with RUST_LOG=debug to follow every step.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    fs::create_dir_all("./pki")?;
    fs::create_dir_all("./certs")?;
    let config = PkiConfig::default().subject(SubjectTemplate {
        country: "SE".into(),
        state_province: "Stockholm".into(),
        organization: "my org".into(),
        ..Default::default()
    });
    let pki = Pki::open_dir("./pki", config)?;

    println!("Creating authority...");
    let ca = pki.create_authority()?;
    ca.save("./certs", "ca")?;

    println!("Issuing server certificate for svc-a...");
    let server = pki.issue_certificate("svc-a", true, &["web"])?;
    server.save("./certs", "svc-a")?;

    println!("Issuing client certificate for svc-b...");
    let client = pki.issue_certificate("svc-b", false, &["ops", "db"])?;
    client.save("./certs", "svc-b")?;
    println!(
        "svc-b groups: {:?}",
        pki.extract_groups(&client.certificate()?)?
    );

    println!("Revoking serial {}...", client.serial());
    pki.revoke_one(client.serial())?;
    let crl = pki.get_crl()?;
    fs::write("./certs/crl.pem", crl.pem())?;

    println!(
        "svc-a revoked: {}, svc-b revoked: {}",
        pki.is_revoked(server.serial()),
        pki.is_revoked(client.serial())
    );
    Ok(())
}
