//! 청크와 메타데이터 정의
//!
//! - Metadata: 파일이 어떻게 청크로 나뉘는지 (24바이트 고정 크기)
//! - Chunk: chunk_size 바이트 단위의 연속 구간 (마지막 청크만 짧을 수 있음)
//! - Shard: 워커 하나가 맡는 연속 청크 ID 구간

use std::ops::Range;

use crate::error::DecodeError;

/// 청크 ID (0부터 시작)
pub type ChunkId = u64;

/// 직렬화된 메타데이터 크기 (u64 3개, 패딩 없음)
pub const METADATA_WIRE_SIZE: usize = 24;

/// 호스트 바이트 순서 -> 네트워크 바이트 순서 (64비트)
///
/// 32비트 변환 두 번으로 구성한다: 하위/상위 절반을 각각 변환한 뒤 자리를 바꾼다.
/// 빅엔디언 호스트에서는 항등 함수.
pub fn host_to_network_u64(value: u64) -> u64 {
    if cfg!(target_endian = "big") {
        return value;
    }
    let low = (value & 0xFFFF_FFFF) as u32;
    let high = (value >> 32) as u32;
    ((low.to_be() as u64) << 32) | high.to_be() as u64
}

/// 네트워크 바이트 순서 -> 호스트 바이트 순서 (64비트)
pub fn network_to_host_u64(value: u64) -> u64 {
    // 바이트 스왑은 자기 자신의 역함수
    host_to_network_u64(value)
}

/// 파일 메타데이터
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// 파일 크기 (바이트)
    pub file_size: u64,

    /// 청크 크기 (바이트)
    pub chunk_size: u64,

    /// 총 청크 수 = ceil(file_size / chunk_size)
    pub num_chunks: u64,
}

impl Metadata {
    /// 파일 크기와 청크 크기로 메타데이터 생성
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        Self {
            file_size,
            chunk_size,
            num_chunks: num_chunks(file_size, chunk_size),
        }
    }

    /// 청크의 바이트 오프셋
    pub fn offset_of(&self, chunk_id: ChunkId) -> u64 {
        chunk_id * self.chunk_size
    }

    /// 청크의 실제 길이 (범위 밖이면 None)
    pub fn chunk_len(&self, chunk_id: ChunkId) -> Option<u64> {
        if chunk_id >= self.num_chunks {
            return None;
        }
        if chunk_id + 1 == self.num_chunks {
            Some(self.file_size - self.chunk_size * (self.num_chunks - 1))
        } else {
            Some(self.chunk_size)
        }
    }

    /// 와이어 포맷으로 직렬화
    ///
    /// 순서: file_size, num_chunks, chunk_size (각각 빅엔디언 u64)
    pub fn to_bytes(&self) -> [u8; METADATA_WIRE_SIZE] {
        let mut buf = [0u8; METADATA_WIRE_SIZE];
        let fields = [self.file_size, self.num_chunks, self.chunk_size];
        for (slot, value) in buf.chunks_exact_mut(8).zip(fields) {
            slot.copy_from_slice(&host_to_network_u64(value).to_ne_bytes());
        }
        buf
    }

    /// 와이어 포맷에서 역직렬화
    ///
    /// 정확히 24바이트가 아니거나 필드 간 관계가 맞지 않으면 실패.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != METADATA_WIRE_SIZE {
            return Err(DecodeError::MalformedMessage(format!(
                "metadata must be {} bytes, got {}",
                METADATA_WIRE_SIZE,
                bytes.len()
            )));
        }

        let mut fields = [0u64; 3];
        for (field, raw) in fields.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(raw);
            *field = network_to_host_u64(u64::from_ne_bytes(word));
        }
        let [file_size, num_chunks, chunk_size] = fields;

        let meta = Self {
            file_size,
            chunk_size,
            num_chunks,
        };
        if self::num_chunks(file_size, chunk_size) != num_chunks
            || (chunk_size == 0 && file_size > 0)
        {
            return Err(DecodeError::MalformedMessage(format!(
                "inconsistent metadata: {:?}",
                meta
            )));
        }
        Ok(meta)
    }
}

/// ceil(file_size / chunk_size)
pub fn num_chunks(file_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size)
}

/// 청크 ID 공간을 워커별 연속 구간으로 분할
///
/// 워커 수는 min(worker_count, num_chunks)로 제한하고 빈 구간은 만들지 않는다.
/// num_chunks == 0 이면 빈 목록.
pub fn plan_shards(num_chunks: u64, worker_count: usize) -> Vec<Range<ChunkId>> {
    if num_chunks == 0 {
        return Vec::new();
    }
    let workers = (worker_count.max(1) as u64).min(num_chunks);
    let per_worker = num_chunks.div_ceil(workers);

    (0..workers)
        .map(|i| {
            let start = i * per_worker;
            let end = (start + per_worker).min(num_chunks);
            start..end
        })
        .filter(|range| !range.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_chunks_and_last_len() {
        for (file_size, chunk_size) in [(1u64, 1u64), (1023, 1024), (1024, 1024), (1025, 1024), (9999, 7)] {
            let meta = Metadata::new(file_size, chunk_size);
            assert_eq!(meta.num_chunks, (file_size + chunk_size - 1) / chunk_size);

            let last = meta.chunk_len(meta.num_chunks - 1).unwrap();
            assert_eq!(last, file_size - chunk_size * (meta.num_chunks - 1));
            assert!(last > 0 && last <= chunk_size);
        }
    }

    #[test]
    fn test_2500_byte_file() {
        let meta = Metadata::new(2500, 1024);
        assert_eq!(meta.num_chunks, 3);
        assert_eq!(meta.chunk_len(0), Some(1024));
        assert_eq!(meta.chunk_len(2), Some(452));
        assert_eq!(meta.chunk_len(3), None);
        assert_eq!(meta.offset_of(2), 2048);
    }

    #[test]
    fn test_empty_file() {
        let meta = Metadata::new(0, 1024);
        assert_eq!(meta.num_chunks, 0);
        assert_eq!(meta.chunk_len(0), None);
        assert!(plan_shards(meta.num_chunks, 4).is_empty());
    }

    #[test]
    fn test_byte_order_vectors() {
        let value = 0x0102_0304_0506_0708u64;
        assert_eq!(host_to_network_u64(value).to_ne_bytes(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(host_to_network_u64(value), value.to_be());
        assert_eq!(network_to_host_u64(host_to_network_u64(value)), value);
        assert_eq!(host_to_network_u64(0), 0);
        assert_eq!(host_to_network_u64(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_metadata_wire_layout() {
        let meta = Metadata::new(2500, 1024);
        let bytes = meta.to_bytes();

        assert_eq!(&bytes[0..8], &2500u64.to_be_bytes());
        assert_eq!(&bytes[8..16], &3u64.to_be_bytes());
        assert_eq!(&bytes[16..24], &1024u64.to_be_bytes());
        assert_eq!(Metadata::from_bytes(&bytes).unwrap(), meta);
    }

    #[test]
    fn test_metadata_rejects_bad_input() {
        assert!(Metadata::from_bytes(&[0u8; 23]).is_err());

        let mut bytes = Metadata::new(2500, 1024).to_bytes();
        bytes[15] = 9; // num_chunks = 9
        assert!(Metadata::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_shard_plan_10_by_4() {
        let shards = plan_shards(10, 4);
        assert_eq!(shards, vec![0..3, 3..6, 6..9, 9..10]);

        let mut covered: Vec<u64> = shards.into_iter().flatten().collect();
        covered.sort_unstable();
        assert_eq!(covered, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_shard_plan_never_empty() {
        assert_eq!(plan_shards(2, 4), vec![0..1, 1..2]);
        // ceil(5/4) = 2 -> 네 번째 워커 몫이 없음
        assert_eq!(plan_shards(5, 4), vec![0..2, 2..4, 4..5]);
        assert_eq!(plan_shards(1, 0), vec![0..1]);
    }
}
