//! Lua scripts for atomic participant mirror updates.
//!
//! Each script touches the room's meta hash and participants hash in one
//! round trip so readers never observe a participant without a room record.

/// Add (or replace) a participant and create the room record on first use.
///
/// Arguments:
/// - KEYS[1]: Room meta hash (`relay:room:{id}:meta`)
/// - KEYS[2]: Participants hash (`relay:room:{id}:participants`)
/// - ARGV[1]: User ID
/// - ARGV[2]: Participant record (JSON string)
/// - ARGV[3]: Timestamp (RFC 3339)
///
/// Returns:
/// - 1: Written
pub const ADD_PARTICIPANT: &str = r"
redis.call('HSETNX', KEYS[1], 'createdAt', ARGV[3])
redis.call('HSET', KEYS[1], 'updatedAt', ARGV[3])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
return 1
";

/// Set `isMicActive` on an existing participant record.
///
/// Arguments:
/// - KEYS[1]: Room meta hash
/// - KEYS[2]: Participants hash
/// - ARGV[1]: User ID
/// - ARGV[2]: '1' for active, '0' for inactive
/// - ARGV[3]: Timestamp (RFC 3339)
///
/// Returns:
/// - 1: Updated
/// - 0: Participant not present (nothing written)
pub const UPDATE_MIC_STATUS: &str = r"
local raw = redis.call('HGET', KEYS[2], ARGV[1])
if raw == nil or raw == false then
    return 0
end

local record = cjson.decode(raw)
record['isMicActive'] = (ARGV[2] == '1')
redis.call('HSET', KEYS[2], ARGV[1], cjson.encode(record))
redis.call('HSET', KEYS[1], 'updatedAt', ARGV[3])
return 1
";

/// Remove a participant and touch the room's `updatedAt`.
///
/// Arguments:
/// - KEYS[1]: Room meta hash
/// - KEYS[2]: Participants hash
/// - ARGV[1]: User ID
/// - ARGV[2]: Timestamp (RFC 3339)
///
/// Returns:
/// - Number of removed participants (0 or 1)
pub const REMOVE_PARTICIPANT: &str = r"
local removed = redis.call('HDEL', KEYS[2], ARGV[1])
if removed > 0 and redis.call('EXISTS', KEYS[1]) == 1 then
    redis.call('HSET', KEYS[1], 'updatedAt', ARGV[2])
end
return removed
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_participant_preserves_created_at() {
        // createdAt is only written when absent
        assert!(ADD_PARTICIPANT.contains("'HSETNX', KEYS[1], 'createdAt'"));
        assert!(ADD_PARTICIPANT.contains("'HSET', KEYS[1], 'updatedAt'"));
    }

    #[test]
    fn test_update_mic_status_skips_absent_participant() {
        assert!(UPDATE_MIC_STATUS.contains("if raw == nil or raw == false then"));
        assert!(UPDATE_MIC_STATUS.contains("return 0"));
    }

    #[test]
    fn test_update_mic_status_only_touches_mic_field() {
        assert!(UPDATE_MIC_STATUS.contains("record['isMicActive']"));
        assert!(!UPDATE_MIC_STATUS.contains("isSpeaking"));
    }

    #[test]
    fn test_remove_participant_does_not_recreate_meta() {
        // A removed room must not be resurrected by a late participant removal
        assert!(REMOVE_PARTICIPANT.contains("redis.call('EXISTS', KEYS[1]) == 1"));
    }
}
