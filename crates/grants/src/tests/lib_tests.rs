use super::*;
use jsonwebtoken::{decode, DecodingKey, Validation};

fn config() -> GrantConfig {
    GrantConfig {
        secret: "unit-test-secret".into(),
        upload_ttl_seconds: 300,
        download_ttl_seconds: 60,
    }
}

#[test]
fn upload_grant_claims_cover_user_path_and_purpose() {
    let cfg = config();
    let grant = mint_upload_grant(&cfg, UserId(7), "12/34/report.pdf").expect("grant");

    let decoded = decode::<serde_json::Value>(
        &grant.token,
        &DecodingKey::from_secret(cfg.secret.as_bytes()),
        &Validation::default(),
    )
    .expect("decode");

    assert_eq!(decoded.claims["sub"], "user:7");
    assert_eq!(decoded.claims["path"], "12/34/report.pdf");
    assert_eq!(decoded.claims["purpose"], "upload");
    assert!(grant.expires_at > Utc::now());
}

#[test]
fn verify_accepts_a_matching_grant() {
    let cfg = config();
    let grant = mint_download_grant(&cfg, UserId(3), "1/2/scan.png").expect("grant");
    verify_grant(&cfg, &grant.token, "1/2/scan.png", GrantPurpose::Download).expect("verify");
}

#[test]
fn verify_rejects_a_different_path() {
    let cfg = config();
    let grant = mint_upload_grant(&cfg, UserId(3), "1/2/scan.png").expect("grant");
    let err = verify_grant(&cfg, &grant.token, "1/2/other.png", GrantPurpose::Upload)
        .expect_err("should fail");
    assert!(matches!(err, GrantError::PathMismatch));
}

#[test]
fn download_grant_cannot_authorize_an_upload() {
    let cfg = config();
    let grant = mint_download_grant(&cfg, UserId(3), "1/2/scan.png").expect("grant");
    let err = verify_grant(&cfg, &grant.token, "1/2/scan.png", GrantPurpose::Upload)
        .expect_err("should fail");
    assert!(matches!(err, GrantError::PurposeMismatch));
}

#[test]
fn verify_rejects_tokens_signed_with_another_secret() {
    let cfg = config();
    let other = GrantConfig {
        secret: "some-other-secret".into(),
        ..config()
    };
    let grant = mint_upload_grant(&other, UserId(3), "1/2/scan.png").expect("grant");
    let err = verify_grant(&cfg, &grant.token, "1/2/scan.png", GrantPurpose::Upload)
        .expect_err("should fail");
    assert!(matches!(err, GrantError::Token(_)));
}

#[test]
fn verify_rejects_expired_grants() {
    let cfg = GrantConfig {
        upload_ttl_seconds: -120,
        ..config()
    };
    let grant = mint_upload_grant(&cfg, UserId(3), "1/2/scan.png").expect("grant");
    let err = verify_grant(&cfg, &grant.token, "1/2/scan.png", GrantPurpose::Upload)
        .expect_err("should fail");
    assert!(matches!(err, GrantError::Token(_)));
}
