// Resident write-path scenarios: the only mutation the driver offers.

mod common;

use common::*;
use stagefs_core::{FsError, MemoryDevice};
use stagefs_filesystems::NtfsVolume;

/// Volume with a 50-byte resident file and a 2-cluster non-resident one.
fn write_volume() -> MemoryDevice {
    let mut b = VolumeBuilder::new();

    let payload: Vec<u8> = (b'a'..=b'z').chain(b'A'..=b'X').collect();
    assert_eq!(payload.len(), 50);
    b.put_record(
        6,
        file_record(6, FLAG_IN_USE, &[resident_attr(AT_DATA, "", 0, 1, &payload)]),
    );

    let mut runs = run(2, 500);
    runs.extend_from_slice(&runs_end());
    b.put_record(
        7,
        file_record(
            7,
            FLAG_IN_USE,
            &[nonres_attr(AT_DATA, "", 0, 1, 0, 1, &runs, 2 * CLUSTER_BYTES, 4096)],
        ),
    );

    let mut sparse_runs = run(1, 520);
    sparse_runs.extend_from_slice(&sparse_run(1));
    sparse_runs.extend_from_slice(&runs_end());
    b.put_record(
        8,
        file_record(
            8,
            FLAG_IN_USE,
            &[nonres_attr(
                AT_DATA,
                "",
                ATTR_SPARSE,
                1,
                0,
                1,
                &sparse_runs,
                CLUSTER_BYTES,
                2 * CLUSTER_BYTES,
            )],
        ),
    );

    b.put_record(
        REC_ROOT,
        file_record(
            REC_ROOT as u32,
            FLAG_IN_USE | FLAG_DIRECTORY,
            &[index_root_attr(
                1,
                &[
                    index_entry(6, "NOTES.TXT", 1, 0x20, 50),
                    index_entry(7, "BIG.BIN", 1, 0x20, 4096),
                    index_entry(8, "THIN.BIN", 1, 0x200, 2 * CLUSTER_BYTES),
                    end_entry(),
                ],
            )],
        ),
    );
    b.device()
}

#[test]
fn test_resident_write_and_readback() {
    let mut vol = NtfsVolume::mount(write_volume()).unwrap();

    vol.open_path("/NOTES.TXT").unwrap();
    assert_eq!(vol.write(b"0123456789").unwrap(), 10);
    assert_eq!(vol.file_position(), Some(10));

    // The same mount sees the new bytes and the unchanged remainder.
    vol.seek(0).unwrap();
    let mut buf = vec![0u8; 64];
    assert_eq!(vol.read(&mut buf).unwrap(), 50);
    assert_eq!(&buf[..10], b"0123456789");
    assert_eq!(&buf[10..26], b"klmnopqrstuvwxyz");

    // So does a fresh mount of the mutated device: the record went to disk
    // with its fix-ups restamped.
    let device = clone_device(&vol);
    let mut vol2 = NtfsVolume::mount(device).unwrap();
    vol2.open_path("/NOTES.TXT").unwrap();
    let mut buf2 = vec![0u8; 64];
    assert_eq!(vol2.read(&mut buf2).unwrap(), 50);
    assert_eq!(&buf2[..50], &buf[..50]);
}

fn clone_device(vol: &NtfsVolume<MemoryDevice>) -> MemoryDevice {
    vol.device_ref().clone()
}

#[test]
fn test_write_offset_inside_value() {
    let mut vol = NtfsVolume::mount(write_volume()).unwrap();
    vol.open_path("/NOTES.TXT").unwrap();
    vol.seek(20).unwrap();
    assert_eq!(vol.write(b"XY").unwrap(), 2);

    vol.seek(18).unwrap();
    let mut buf = [0u8; 6];
    assert_eq!(vol.read(&mut buf).unwrap(), 6);
    assert_eq!(&buf, b"stXYwx");
}

#[test]
fn test_write_past_value_end_is_rejected() {
    let mut vol = NtfsVolume::mount(write_volume()).unwrap();
    vol.open_path("/NOTES.TXT").unwrap();
    vol.seek(45).unwrap();
    let err = vol.write(b"0123456789").unwrap_err();
    assert!(matches!(err, FsError::WriteRejected(_)));
    assert!(err.to_string().contains("past end"));
}

#[test]
fn test_write_nonresident_is_fatal() {
    let mut vol = NtfsVolume::mount(write_volume()).unwrap();
    vol.open_path("/BIG.BIN").unwrap();
    let err = vol.write(b"data").unwrap_err();
    assert!(matches!(err, FsError::WriteRejected(_)));
    assert!(err.to_string().contains("non-resident"));
}

#[test]
fn test_write_sparse_is_fatal() {
    let mut vol = NtfsVolume::mount(write_volume()).unwrap();
    vol.open_path("/THIN.BIN").unwrap();
    let err = vol.write(b"data").unwrap_err();
    assert!(matches!(err, FsError::WriteRejected(_)));
    assert!(err.to_string().contains("sparse"));
}

#[test]
fn test_write_compressed_is_fatal() {
    let mut b = VolumeBuilder::new();
    let mut runs = run(1, 540);
    runs.extend_from_slice(&sparse_run(15));
    runs.extend_from_slice(&runs_end());
    b.put_record(
        6,
        file_record(
            6,
            FLAG_IN_USE,
            &[nonres_attr(
                AT_DATA,
                "",
                ATTR_COMPRESSED,
                1,
                0,
                15,
                &runs,
                16 * CLUSTER_BYTES,
                4096,
            )],
        ),
    );
    b.put_record(
        REC_ROOT,
        file_record(
            REC_ROOT as u32,
            FLAG_IN_USE | FLAG_DIRECTORY,
            &[index_root_attr(
                1,
                &[index_entry(6, "PACKED.BIN", 1, 0x820, 4096), end_entry()],
            )],
        ),
    );
    let mut vol = NtfsVolume::mount(b.device()).unwrap();
    vol.open_path("/PACKED.BIN").unwrap();
    let err = vol.write(b"data").unwrap_err();
    assert!(matches!(err, FsError::WriteRejected(_)));
    assert!(err.to_string().contains("compressed"));
}

#[test]
fn test_write_requires_freshly_validated_record() {
    let mut vol = NtfsVolume::mount(write_volume()).unwrap();
    vol.open_path("/NOTES.TXT").unwrap();

    // Another record gets fix-up-validated in between; the stale open
    // record may no longer be written.
    vol.list_dir("/").unwrap();
    let err = vol.write(b"0123456789").unwrap_err();
    assert!(matches!(err, FsError::WriteRejected(_)));

    // Re-opening revalidates and the write goes through again.
    vol.open_path("/NOTES.TXT").unwrap();
    assert_eq!(vol.write(b"0123456789").unwrap(), 10);
}

#[test]
fn test_consecutive_writes_advance_position() {
    let mut vol = NtfsVolume::mount(write_volume()).unwrap();
    vol.open_path("/NOTES.TXT").unwrap();
    assert_eq!(vol.write(b"AAAA").unwrap(), 4);
    assert_eq!(vol.write(b"BBBB").unwrap(), 4);

    vol.seek(0).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(vol.read(&mut buf).unwrap(), 8);
    assert_eq!(&buf, b"AAAABBBB");
}

#[test]
fn test_write_to_directory_is_rejected() {
    let mut vol = NtfsVolume::mount(write_volume()).unwrap();
    vol.open_path("/").unwrap();
    assert!(matches!(vol.write(b"x"), Err(FsError::Corrupt(_))));
}
