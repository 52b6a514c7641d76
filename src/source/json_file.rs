use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use cid::Cid;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::source::{
    CidSource, OpenFileSnafu, ParseFileSnafu, ReadFileSnafu, SourceError, TrackableCid,
};

/// Layout of the `PublicationTime` field: RFC 3339 with optional fractional
/// seconds, matching what the exporter writes.
const PUBLICATION_TIME_LAYOUT: &str = "%+";

/// Envelope document of a provider-record export.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ProviderRecords {
    #[serde(rename = "EncapsulatedJSONProviderRecords", default)]
    pub records: Vec<ProviderRecord>,
}

/// One exported provider record. All fields are strings on the wire; they
/// are parsed lazily when the record is drawn, so one bad record skips
/// instead of failing the whole file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    #[serde(rename = "CID")]
    pub cid: String,
    /// Peer that held the provider record.
    #[serde(rename = "ID")]
    pub id: String,
    /// Peer that originally published the record.
    #[serde(rename = "Creator")]
    pub creator: String,
    /// Duration string such as `"12ms"`.
    #[serde(rename = "ProvideTime")]
    pub provide_time: String,
    #[serde(rename = "PublicationTime")]
    pub publication_time: String,
    #[serde(rename = "UserAgent", default)]
    pub user_agent: String,
    #[serde(rename = "Addresses", default)]
    pub addresses: Vec<String>,
}

/// Replays CIDs from JSON provider-record exports.
///
/// Two file shapes are accepted: a *simple* file holding a single envelope
/// document, and an *encoded* file holding one or more envelope documents
/// concatenated back to back (the exporter appends a document per flush).
#[derive(Debug)]
pub struct JsonFileCidSource {
    records: VecDeque<ProviderRecord>,
}

impl JsonFileCidSource {
    /// Open a file holding a single envelope document.
    pub fn from_simple_file(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        Self::from_simple_files(&[path.as_ref().to_path_buf()])
    }

    /// Open several simple files; record order follows argument order.
    pub fn from_simple_files(paths: &[PathBuf]) -> Result<Self, SourceError> {
        let mut records = VecDeque::new();
        for path in paths {
            let raw = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
            let parsed: ProviderRecords =
                serde_json::from_str(&raw).context(ParseFileSnafu { path })?;
            records.extend(parsed.records);
        }
        Ok(Self { records })
    }

    /// Open a file holding one or more concatenated envelope documents,
    /// decoded as a stream.
    pub fn from_encoded_file(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        Self::from_encoded_files(&[path.as_ref().to_path_buf()])
    }

    /// Open several encoded files; record order follows argument order.
    pub fn from_encoded_files(paths: &[PathBuf]) -> Result<Self, SourceError> {
        let mut records = VecDeque::new();
        for path in paths {
            let file = File::open(path).context(OpenFileSnafu { path })?;
            let stream = serde_json::Deserializer::from_reader(BufReader::new(file))
                .into_iter::<ProviderRecords>();
            for document in stream {
                let document = document.context(ParseFileSnafu { path })?;
                records.extend(document.records);
            }
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn parse_record(record: &ProviderRecord) -> Option<TrackableCid> {
        let cid: Cid = match record.cid.parse() {
            Ok(cid) => cid,
            Err(err) => {
                warn!(cid = %record.cid, error = %err, "skipping record with unparseable cid");
                return None;
            }
        };
        let provider: PeerId = match record.id.parse() {
            Ok(peer) => peer,
            Err(err) => {
                warn!(cid = %record.cid, error = %err, "skipping record with unparseable provider id");
                return None;
            }
        };
        let creator: PeerId = match record.creator.parse() {
            Ok(peer) => peer,
            Err(err) => {
                warn!(cid = %record.cid, error = %err, "skipping record with unparseable creator id");
                return None;
            }
        };
        let provide_latency = match humantime::parse_duration(&record.provide_time) {
            Ok(duration) => duration,
            Err(err) => {
                warn!(cid = %record.cid, error = %err, "skipping record with unparseable provide time");
                return None;
            }
        };
        let publication_time =
            match DateTime::parse_from_str(&record.publication_time, PUBLICATION_TIME_LAYOUT) {
                Ok(stamp) => stamp.to_utc(),
                Err(err) => {
                    warn!(cid = %record.cid, error = %err, "skipping record with unparseable publication time");
                    return None;
                }
            };

        // A bad address drops just that address, not the record.
        let mut multiaddrs = Vec::with_capacity(record.addresses.len());
        for addr in &record.addresses {
            match addr.parse::<Multiaddr>() {
                Ok(maddr) => multiaddrs.push(maddr),
                Err(err) => debug!(addr = %addr, error = %err, "dropping unparseable multiaddress"),
            }
        }

        debug!(cid = %cid, provider = %provider, "replaying provider record");
        Some(TrackableCid {
            cid,
            provider: Some(provider),
            creator: Some(creator),
            provide_latency: Some(provide_latency),
            publication_time: Some(publication_time),
            user_agent: Some(record.user_agent.clone()),
            multiaddrs,
        })
    }
}

impl CidSource for JsonFileCidSource {
    fn next(&mut self) -> Result<Option<TrackableCid>, SourceError> {
        while let Some(record) = self.records.pop_front() {
            if let Some(trackable) = Self::parse_record(&record) {
                return Ok(Some(trackable));
            }
        }
        Ok(None)
    }

    fn kind(&self) -> &'static str {
        "json-file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(cid: &Cid, provider: &PeerId, creator: &PeerId) -> ProviderRecord {
        ProviderRecord {
            cid: cid.to_string(),
            id: provider.to_string(),
            creator: creator.to_string(),
            provide_time: "12ms".into(),
            publication_time: "2023-04-11T09:30:00.123456789+00:00".into(),
            user_agent: "kubo/0.19.0".into(),
            addresses: vec![
                "/ip4/10.0.0.7/tcp/4001".into(),
                "not a multiaddr".into(),
            ],
        }
    }

    fn sample_cid(seed: u8) -> Cid {
        use multihash_codetable::{Code, MultihashDigest};
        Cid::new_v1(0x55, Code::Sha2_256.digest(&[seed]))
    }

    fn write_envelope(records: &[ProviderRecord]) -> tempfile::NamedTempFile {
        let envelope = ProviderRecords {
            records: records.to_vec(),
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&envelope).unwrap().as_bytes())
            .unwrap();
        file
    }

    #[test]
    fn simple_file_replays_records_in_order() {
        let provider = PeerId::random();
        let creator = PeerId::random();
        let (a, b) = (sample_cid(1), sample_cid(2));
        let file = write_envelope(&[
            record(&a, &provider, &creator),
            record(&b, &provider, &creator),
        ]);

        let mut source = JsonFileCidSource::from_simple_file(file.path()).unwrap();
        assert_eq!(source.len(), 2);

        let first = source.next().unwrap().unwrap();
        assert_eq!(first.cid, a);
        assert_eq!(first.provider, Some(provider));
        assert_eq!(first.creator, Some(creator));
        assert_eq!(first.provide_latency, Some(std::time::Duration::from_millis(12)));
        // The malformed address is dropped, the valid one survives.
        assert_eq!(first.multiaddrs.len(), 1);
        assert!(first.is_replayed());

        assert_eq!(source.next().unwrap().unwrap().cid, b);
        assert!(source.next().unwrap().is_none());
    }

    #[test]
    fn encoded_file_decodes_concatenated_documents() {
        let provider = PeerId::random();
        let creator = PeerId::random();
        let first = ProviderRecords {
            records: vec![record(&sample_cid(3), &provider, &creator)],
        };
        let second = ProviderRecords {
            records: vec![
                record(&sample_cid(4), &provider, &creator),
                record(&sample_cid(5), &provider, &creator),
            ],
        };

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&first).unwrap().as_bytes())
            .unwrap();
        file.write_all(serde_json::to_string(&second).unwrap().as_bytes())
            .unwrap();

        let source = JsonFileCidSource::from_encoded_file(file.path()).unwrap();
        assert_eq!(source.len(), 3);
    }

    #[test]
    fn encoded_stream_matches_union_of_simple_files() {
        let provider = PeerId::random();
        let creator = PeerId::random();
        let doc_a = ProviderRecords {
            records: vec![record(&sample_cid(6), &provider, &creator)],
        };
        let doc_b = ProviderRecords {
            records: vec![record(&sample_cid(7), &provider, &creator)],
        };

        let simple_a = write_envelope(&doc_a.records);
        let simple_b = write_envelope(&doc_b.records);
        let mut concatenated = tempfile::NamedTempFile::new().unwrap();
        concatenated
            .write_all(serde_json::to_string(&doc_a).unwrap().as_bytes())
            .unwrap();
        concatenated
            .write_all(serde_json::to_string(&doc_b).unwrap().as_bytes())
            .unwrap();

        let mut from_simple = JsonFileCidSource::from_simple_files(&[
            simple_a.path().to_path_buf(),
            simple_b.path().to_path_buf(),
        ])
        .unwrap();
        let mut from_encoded = JsonFileCidSource::from_encoded_file(concatenated.path()).unwrap();

        loop {
            let (a, b) = (from_simple.next().unwrap(), from_encoded.next().unwrap());
            match (a, b) {
                (None, None) => break,
                (Some(a), Some(b)) => assert_eq!(a.cid, b.cid),
                (a, b) => panic!("sources diverged: {a:?} vs {b:?}"),
            }
        }
    }

    #[test]
    fn malformed_record_is_skipped_not_fatal() {
        let provider = PeerId::random();
        let creator = PeerId::random();
        let mut bad = record(&sample_cid(8), &provider, &creator);
        bad.cid = "definitely not a cid".into();
        let good = record(&sample_cid(9), &provider, &creator);
        let file = write_envelope(&[bad, good]);

        let mut source = JsonFileCidSource::from_simple_file(file.path()).unwrap();
        let only = source.next().unwrap().unwrap();
        assert_eq!(only.cid, sample_cid(9));
        assert!(source.next().unwrap().is_none());
    }

    #[test]
    fn structurally_invalid_file_aborts_open() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ this is not json ").unwrap();

        assert!(matches!(
            JsonFileCidSource::from_simple_file(file.path()),
            Err(SourceError::ParseFile { .. })
        ));
        assert!(matches!(
            JsonFileCidSource::from_encoded_file(file.path()),
            Err(SourceError::ParseFile { .. })
        ));
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let result = JsonFileCidSource::from_encoded_file("/nonexistent/records.json");
        assert!(matches!(result, Err(SourceError::OpenFile { .. })));
    }
}
