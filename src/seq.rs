//! 시퀀스 번호 모듈러 연산
//!
//! 시퀀스 번호는 u32 공간에서 순환한다. 두 번호의 차이가 `2^31` 미만이라는
//! 가정 하에 반공간(half-space) 비교를 쓴다. 윈도우 크기는 [`crate::MAX_WINDOW`]로
//! 제한되므로 이 가정은 항상 성립한다.

/// `a`가 `b`보다 앞서는지 (a < b, 순환 고려)
#[inline]
pub fn is_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// a ≤ b (순환 고려)
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || is_before(a, b)
}

/// `from`에서 `to`까지의 거리
#[inline]
pub fn distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}

/// `seq`가 `[start, start + len)` 범위 안에 있는지
#[inline]
pub fn in_window(seq: u32, start: u32, len: usize) -> bool {
    (distance(start, seq) as u64) < len as u64
}
