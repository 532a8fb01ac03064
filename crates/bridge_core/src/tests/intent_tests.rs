use super::*;

#[test]
fn avatar_hash_is_lowercase_sha256_hex() {
    assert_eq!(
        avatar_hash(b"abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(avatar_hash(b"abc"), avatar_hash(b"abc"));
    assert_ne!(avatar_hash(b"abc"), avatar_hash(b"abd"));
}

#[test]
fn content_type_is_sniffed_from_magic_bytes() {
    assert_eq!(detect_content_type(b"\x89PNG\r\n\x1a\nrest"), "image/png");
    assert_eq!(detect_content_type(b"\xff\xd8\xff\xe0jfif"), "image/jpeg");
    assert_eq!(detect_content_type(b"GIF89a...."), "image/gif");
    assert_eq!(detect_content_type(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
    assert_eq!(
        detect_content_type(b"plain bytes"),
        "application/octet-stream"
    );
    assert_eq!(detect_content_type(b""), "application/octet-stream");
}
