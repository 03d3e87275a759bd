use crate::{CrashSnapshot, EncodingError, FormatError};
use scroll::{LE, Pread, Pwrite, SizeWith};

/// The version written by [`encode`], and the only one [`decode`] accepts
pub const FORMAT_VERSION: u16 = 1;

const MAGIC: u32 = u32::from_le_bytes(*b"CRPT");

/// Set when the snapshot carries any [`crate::Degradation`], so that a backend
/// can tell without parsing the body
const FLAG_DEGRADED: u16 = 1 << 0;

#[derive(Pread, Pwrite, SizeWith)]
struct Envelope {
    magic: u32,
    version: u16,
    flags: u16,
    body_len: u32,
}

const ENVELOPE_LEN: usize = 4 + 2 + 2 + 4;

/// Encodes a snapshot as a versioned report
///
/// The same snapshot always encodes to the same bytes.
pub fn encode(snapshot: &CrashSnapshot) -> Result<Vec<u8>, EncodingError> {
    if snapshot.id.is_nil() {
        return Err(EncodingError::NilId);
    }

    let body = serde_json::to_vec(snapshot)?;
    let body_len = u32::try_from(body.len()).map_err(|_err| EncodingError::TooLarge(body.len()))?;

    let envelope = Envelope {
        magic: MAGIC,
        version: FORMAT_VERSION,
        flags: if snapshot.degraded.is_empty() {
            0
        } else {
            FLAG_DEGRADED
        },
        body_len,
    };

    let mut report = vec![0u8; ENVELOPE_LEN + body.len()];
    report
        .pwrite_with(envelope, 0, LE)
        .map_err(|err| EncodingError::Serialize(serde::ser::Error::custom(err)))?;
    report[ENVELOPE_LEN..].copy_from_slice(&body);

    Ok(report)
}

/// Decodes a report produced by [`encode`]
pub fn decode(report: &[u8]) -> Result<CrashSnapshot, FormatError> {
    if report.len() < ENVELOPE_LEN {
        return Err(FormatError::Truncated {
            needed: ENVELOPE_LEN,
            available: report.len(),
        });
    }

    let envelope: Envelope = report.pread_with(0, LE)?;
    if envelope.magic != MAGIC {
        return Err(FormatError::BadMagic(envelope.magic));
    }
    if envelope.version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(envelope.version));
    }

    let end = ENVELOPE_LEN + envelope.body_len as usize;
    let body = report
        .get(ENVELOPE_LEN..end)
        .ok_or(FormatError::Truncated {
            needed: end,
            available: report.len(),
        })?;

    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Degradation, Fault, LoadedImage, ProcessMetadata, ThreadState};
    use proptest::{collection::vec, option, prelude::*};

    fn fault() -> impl Strategy<Value = Fault> {
        prop_oneof![
            (any::<i32>(), any::<i32>(), any::<u64>()).prop_map(|(signo, code, address)| {
                Fault::Signal {
                    signo,
                    code,
                    address,
                }
            }),
            (".*", option::of("[a-z/]+\\.rs:[0-9]+:[0-9]+")).prop_map(|(message, location)| {
                Fault::Panic { message, location }
            }),
            any::<u64>().prop_map(|unresponsive_ms| Fault::Hang { unresponsive_ms }),
        ]
    }

    fn thread() -> impl Strategy<Value = ThreadState> {
        (
            any::<i32>(),
            any::<bool>(),
            any::<u64>(),
            any::<u64>(),
            vec(any::<u64>(), 0..32),
            any::<u64>(),
            vec(any::<u8>(), 0..512),
        )
            .prop_map(
                |(tid, crashed, pc, sp, registers, stack_base, stack)| ThreadState {
                    tid,
                    crashed,
                    pc,
                    sp,
                    registers,
                    stack_base,
                    stack,
                },
            )
    }

    fn image() -> impl Strategy<Value = LoadedImage> {
        (any::<u64>(), any::<u64>(), vec(any::<u8>(), 0..20), "/[a-z/.]{1,40}").prop_map(
            |(base, end, build_id, path)| LoadedImage {
                base,
                end,
                build_id,
                path,
            },
        )
    }

    fn metadata() -> impl Strategy<Value = ProcessMetadata> {
        (
            any::<u32>(),
            "[A-Za-z]{1,10}",
            "[0-9.]{1,10}",
            option::of("[A-Za-z0-9 ]{1,16}"),
            proptest::collection::btree_map("[a-z.]{1,8}", ".*", 0..4),
        )
            .prop_map(|(pid, os_name, os_version, device_model, attributes)| {
                ProcessMetadata {
                    pid,
                    os_name,
                    os_version,
                    arch: "aarch64".to_owned(),
                    app_name: "app".to_owned(),
                    app_version: "0.1.0".to_owned(),
                    device_model,
                    attributes,
                }
            })
    }

    prop_compose! {
        fn snapshot()(
            id in any::<u128>().prop_filter("nil", |id| *id != 0),
            secs in 0i64..4_102_444_800,
            nanos in 0u32..1_000_000_000,
            fault in fault(),
            crashed_thread in any::<i32>(),
            threads in vec(thread(), 0..4),
            missing_threads in vec(any::<i32>(), 0..4),
            images in vec(image(), 0..4),
            metadata in metadata(),
            degraded in any::<u32>(),
        ) -> CrashSnapshot {
            CrashSnapshot {
                id: uuid::Uuid::from_u128(id),
                timestamp: chrono::DateTime::from_timestamp(secs, nanos).unwrap(),
                fault,
                crashed_thread,
                threads,
                missing_threads,
                images,
                metadata,
                degraded: Degradation::from_bits_retain(degraded),
            }
        }
    }

    proptest! {
        #[test]
        fn round_trips(snap in snapshot()) {
            let report = encode(&snap).unwrap();
            prop_assert_eq!(decode(&report).unwrap(), snap);
        }

        #[test]
        fn is_deterministic(snap in snapshot()) {
            prop_assert_eq!(encode(&snap).unwrap(), encode(&snap.clone()).unwrap());
        }
    }

    fn minimal() -> CrashSnapshot {
        CrashSnapshot {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            fault: Fault::Signal {
                signo: 6,
                code: -6,
                address: 0,
            },
            crashed_thread: 1,
            threads: Vec::new(),
            missing_threads: Vec::new(),
            images: Vec::new(),
            metadata: ProcessMetadata::default(),
            degraded: Degradation::empty(),
        }
    }

    #[test]
    fn rejects_nil_id() {
        let mut snap = minimal();
        snap.id = uuid::Uuid::nil();
        assert!(matches!(encode(&snap), Err(EncodingError::NilId)));
    }

    #[test]
    fn envelope() {
        let mut snap = minimal();
        let report = encode(&snap).unwrap();
        assert_eq!(&report[..4], b"CRPT");
        assert_eq!(&report[4..6], &FORMAT_VERSION.to_le_bytes());
        assert_eq!(&report[6..8], &[0, 0]);

        snap.degraded = Degradation::THREADS_MISSING;
        let report = encode(&snap).unwrap();
        assert_eq!(&report[6..8], &FLAG_DEGRADED.to_le_bytes());
    }

    #[test]
    fn decode_failures() {
        let report = encode(&minimal()).unwrap();

        assert!(matches!(
            decode(&report[..8]),
            Err(FormatError::Truncated { .. })
        ));
        assert!(matches!(
            decode(&report[..report.len() - 1]),
            Err(FormatError::Truncated { .. })
        ));

        let mut bad = report.clone();
        bad[0] = b'X';
        assert!(matches!(decode(&bad), Err(FormatError::BadMagic(_))));

        let mut bad = report.clone();
        bad[4] = 2;
        assert!(matches!(
            decode(&bad),
            Err(FormatError::UnsupportedVersion(2))
        ));

        let mut bad = report;
        let last = bad.len() - 1;
        bad[last] = b'!';
        assert!(matches!(decode(&bad), Err(FormatError::Malformed(_))));
    }
}
