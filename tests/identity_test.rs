use lanbeam::Identity;

#[test]
fn fresh_start_creates_identity_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("identity.json");
    assert!(!path.exists());

    let identity = Identity::load_or_generate(&path)?;
    assert!(path.exists());

    // Two non-empty hex fields, camelCase names.
    let content = std::fs::read_to_string(&path)?;
    let json: serde_json::Value = serde_json::from_str(&content)?;
    let private_key = json["privateKey"].as_str().unwrap();
    let public_key = json["publicKey"].as_str().unwrap();
    assert!(!private_key.is_empty());
    assert!(!public_key.is_empty());
    assert!(hex::decode(private_key).is_ok());
    assert_eq!(hex::decode(public_key)?.len(), 32); // raw Ed25519 public key
    assert_eq!(hex::decode(public_key)?, identity.public_key());
    Ok(())
}

#[test]
fn second_start_loads_the_same_keypair() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("identity.json");

    let first = Identity::load_or_generate(&path)?;
    let second = Identity::load_or_generate(&path)?;
    assert_eq!(first.public_key_hex(), second.public_key_hex());
    Ok(())
}

#[test]
fn corrupt_identity_file_is_regenerated() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("identity.json");
    std::fs::write(&path, "{not json")?;

    let identity = Identity::load_or_generate(&path)?;
    assert!(!identity.public_key_hex().is_empty());

    // The replacement file is valid and loads back.
    let reloaded = Identity::load_or_generate(&path)?;
    assert_eq!(identity.public_key_hex(), reloaded.public_key_hex());
    Ok(())
}

#[test]
fn mismatched_keys_count_as_corruption() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("identity.json");

    let original = Identity::load_or_generate(&path)?;
    // Swap in a different public key next to the stored private key.
    let other = Identity::load_or_generate(&dir.path().join("other.json"))?;
    let content = std::fs::read_to_string(&path)?;
    let mut json: serde_json::Value = serde_json::from_str(&content)?;
    json["publicKey"] = serde_json::Value::String(other.public_key_hex());
    std::fs::write(&path, serde_json::to_string(&json)?)?;

    let regenerated = Identity::load_or_generate(&path)?;
    assert_ne!(regenerated.public_key_hex(), original.public_key_hex());
    assert_ne!(regenerated.public_key_hex(), other.public_key_hex());
    Ok(())
}

#[test]
fn signatures_break_under_any_mutation() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let identity = Identity::load_or_generate(&dir.path().join("identity.json"))?;

    let payload = b"beacon payload".to_vec();
    let signature = identity.sign(&payload)?;
    let public_key = identity.public_key().to_vec();

    assert!(lanbeam::crypto::verify_signature(&payload, &signature, &public_key)?);

    // Flip one byte in each of the three inputs in turn.
    let mut bad_payload = payload.clone();
    bad_payload[0] ^= 0x01;
    assert!(!lanbeam::crypto::verify_signature(&bad_payload, &signature, &public_key)?);

    let mut bad_signature = signature.clone();
    bad_signature[0] ^= 0x01;
    assert!(!lanbeam::crypto::verify_signature(&payload, &bad_signature, &public_key)?);

    let mut bad_key = public_key.clone();
    bad_key[0] ^= 0x01;
    assert!(!lanbeam::crypto::verify_signature(&payload, &signature, &bad_key)?);
    Ok(())
}
