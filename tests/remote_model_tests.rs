#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::Arc;

use drive_fs::Error;
use drive_fs::remote::{BANNED_MIMES, FOLDER_MIME, Grantee, ObjectKind, Permission, Role};

use common::{at, file, folder};

fn grant(id: &str, role: Role, grantee: Grantee) -> Permission {
    Permission {
        id: id.to_owned(),
        role,
        grantee,
    }
}

#[test]
fn kinds_follow_the_mime_type() {
    assert_eq!(folder("d", "d").kind().unwrap(), ObjectKind::Directory);
    assert_eq!(file("f", "f", 1).kind().unwrap(), ObjectKind::File);

    for mime in BANNED_MIMES {
        let mut obj = file("x", "x", 0);
        obj.mime_type = mime.to_owned();
        assert!(
            matches!(obj.kind(), Err(Error::BannedContentKind(m)) if m == mime),
            "{mime} should be banned"
        );
    }
    assert_ne!(FOLDER_MIME, BANNED_MIMES[0]);
}

#[test]
fn atime_prefers_the_latest_known_time() {
    let mut obj = file("f", "f", 1);
    obj.viewed = Some(at(200));
    obj.modified = Some(at(100));
    assert_eq!(obj.atime(), at(200));

    obj.viewed = Some(at(50));
    assert_eq!(obj.atime(), at(100));

    obj.viewed = None;
    assert_eq!(obj.atime(), at(100));

    obj.modified = None;
    assert_eq!(obj.atime(), obj.crtime());
    assert_eq!(obj.mtime(), std::time::SystemTime::UNIX_EPOCH);
}

#[test]
fn only_the_accounts_own_user_entry_counts() {
    let mut obj = folder("d", "d");
    obj.permissions = vec![
        grant("someone", Role::Owner, Grantee::User),
        grant("me", Role::Reader, Grantee::User),
    ];
    assert_eq!(obj.perms("me").bits(), 0o500);
    assert_eq!(obj.perms("nobody").bits(), 0);
}

#[test]
fn anyone_grants_group_and_other() {
    let mut obj = folder("d", "d");
    obj.permissions = vec![grant("anyone", Role::Writer, Grantee::Anyone)];
    assert_eq!(obj.perms("me").bits(), 0o077);
}

#[test]
fn domain_and_group_grants_are_ignored() {
    let mut obj = folder("d", "d");
    obj.permissions = vec![
        grant("corp", Role::Writer, Grantee::Domain),
        grant("team", Role::Owner, Grantee::Group),
    ];
    assert_eq!(obj.perms("me").bits(), 0);
}

#[test]
fn files_never_get_execute_bits() {
    let mut obj = file("f", "f", 1);
    obj.permissions = vec![
        grant("me", Role::Owner, Grantee::User),
        grant("anyone", Role::Reader, Grantee::Anyone),
    ];
    assert_eq!(obj.perms("me").bits(), 0o644);
}

#[test]
fn errors_map_to_errnos() {
    let cases = [
        (Error::NotFound, libc::ENOENT),
        (Error::BannedContentKind("x".to_owned()), libc::ENOENT),
        (Error::NotADirectory, libc::ENOTDIR),
        (Error::IsADirectory, libc::EISDIR),
        (Error::Cancelled, libc::EINTR),
        (Error::Shutdown, libc::ESTALE),
        (Error::BadHandle, libc::EBADF),
        (Error::InvalidId("a/b".to_owned()), libc::EINVAL),
        (Error::InvariantViolation("x"), libc::EIO),
        (
            Error::transport(std::io::Error::other("reset")),
            libc::EIO,
        ),
        (
            Error::LocalIo(Arc::new(std::io::Error::from_raw_os_error(libc::ENOSPC))),
            libc::ENOSPC,
        ),
        (
            Error::LocalIo(Arc::new(std::io::Error::other("weird"))),
            libc::EIO,
        ),
    ];
    for (err, errno) in cases {
        assert_eq!(err.errno(), errno, "{err}");
    }
}
