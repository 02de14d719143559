//! Session：多个 Stream 共享的音量 / 静音作用域
//!
//! Session 由 (opaque id, endpoint) 标识，存放在 [`SessionRegistry`] 中。
//! 锁顺序固定为 registry 表锁 → 成员 Stream 锁，pump 和 buffer region 路径只拿 Stream 锁。
//!
//! Session 在 registry 存活期间一直保留（没有成员之后也保留音量设置），
//! 只有宿主显式调用 [`SessionRegistry::prune_expired`] 才会回收。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::stream::{StreamShared, StreamState};
use crate::audio::volume::SessionVolume;
use crate::error::{Result, StreamError};

/// Session 的 opaque 标识
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(pub u128);

impl SessionId {
    /// 随机生成一个新标识
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xFFFF_FFFF_FFFF
        )
    }
}

/// registry 的键
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub id: SessionId,
    pub endpoint: String,
}

impl SessionKey {
    pub fn new(id: SessionId, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
        }
    }
}

/// Session 状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// 至少一个成员 Stream 在运行
    Active,
    /// 有成员，但都没有运行
    Inactive,
    /// 没有成员
    Expired,
}

struct SessionData {
    volume: SessionVolume,
    members: Vec<Weak<StreamShared>>,
}

impl SessionData {
    fn new() -> Self {
        Self {
            volume: SessionVolume::unity(0),
            members: Vec::new(),
        }
    }

    /// 声道数组至少与最宽的成员一样宽，新声道音量为 1.0
    fn grow_channels(&mut self, channels: usize) {
        if self.volume.channel_vols.len() < channels {
            self.volume.channel_vols.resize(channels, 1.0);
        }
    }

    fn live_members(&self) -> impl Iterator<Item = Arc<StreamShared>> + '_ {
        self.members.iter().filter_map(Weak::upgrade)
    }

    /// 把音量快照推给每个成员（调用方持有表锁）
    fn propagate(&self) {
        for member in self.live_members() {
            member.lock().apply_session_volume(&self.volume);
        }
    }

    fn state(&self) -> SessionState {
        let mut any = false;
        for member in self.live_members() {
            any = true;
            if member.lock().state() == StreamState::Started {
                return SessionState::Active;
            }
        }
        if any {
            SessionState::Inactive
        } else {
            SessionState::Expired
        }
    }
}

/// Session 表
///
/// 由 [`crate::engine::AudioContext`] 持有，随 context 创建和销毁
pub struct SessionRegistry {
    table: Mutex<HashMap<SessionKey, SessionData>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionKey, SessionData>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 获取（必要时创建）一个 session 的控制句柄
    pub fn control(self: &Arc<Self>, key: SessionKey) -> SessionControl {
        self.lock().entry(key.clone()).or_insert_with(SessionData::new);
        SessionControl {
            registry: Arc::clone(self),
            key,
        }
    }

    /// 把 Stream 加入 session
    ///
    /// `init` 在表锁内执行，拿到 session 当前的音量快照；它失败时撤销加入
    pub(crate) fn attach<R>(
        &self,
        key: &SessionKey,
        channels: usize,
        member: &Arc<StreamShared>,
        init: impl FnOnce(&SessionVolume) -> Result<R>,
    ) -> Result<R> {
        let mut table = self.lock();
        let created = !table.contains_key(key);
        let session = table.entry(key.clone()).or_insert_with(SessionData::new);
        session.grow_channels(channels);

        match init(&session.volume) {
            Ok(value) => {
                session.members.retain(|m| m.strong_count() > 0);
                session.members.push(Arc::downgrade(member));
                log::debug!(
                    "Stream joined {} session {} on '{}' ({} members)",
                    if created { "new" } else { "existing" },
                    key.id,
                    key.endpoint,
                    session.members.len()
                );
                Ok(value)
            }
            Err(err) => {
                if created {
                    table.remove(key);
                }
                Err(err)
            }
        }
    }

    /// 把 Stream 移出 session；session 本身保留
    pub(crate) fn detach(&self, key: &SessionKey, member: &Arc<StreamShared>) {
        let mut table = self.lock();
        if let Some(session) = table.get_mut(key) {
            let target = Arc::as_ptr(member);
            session
                .members
                .retain(|m| m.strong_count() > 0 && m.as_ptr() != target);
        }
    }

    /// 回收没有成员的 session，返回回收的数量
    pub fn prune_expired(&self) -> usize {
        let mut table = self.lock();
        let before = table.len();
        table.retain(|_, session| session.live_members().next().is_some());
        let pruned = before - table.len();
        if pruned > 0 {
            log::debug!("Pruned {} expired sessions", pruned);
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        self.lock().keys().cloned().collect()
    }

    /// 在表锁内修改 session；`propagate` 为 true 时把结果推给成员
    fn with_session<R>(
        &self,
        key: &SessionKey,
        propagate: bool,
        f: impl FnOnce(&mut SessionData) -> Result<R>,
    ) -> Result<R> {
        let mut table = self.lock();
        let session = table.entry(key.clone()).or_insert_with(SessionData::new);
        let value = f(session)?;
        if propagate {
            session.propagate();
        }
        Ok(value)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}

pub(crate) fn check_level(level: f32) -> Result<()> {
    if (0.0..=1.0).contains(&level) {
        Ok(())
    } else {
        Err(StreamError::InvalidArgument("volume level"))
    }
}

/// Session 级音量控制
#[derive(Clone)]
pub struct SessionControl {
    registry: Arc<SessionRegistry>,
    key: SessionKey,
}

impl SessionControl {
    #[inline]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn set_master_volume(&self, level: f32) -> Result<()> {
        check_level(level)?;
        self.registry.with_session(&self.key, true, |s| {
            s.volume.master = level;
            Ok(())
        })
    }

    pub fn master_volume(&self) -> f32 {
        self.registry
            .with_session(&self.key, false, |s| Ok(s.volume.master))
            .unwrap_or(1.0)
    }

    pub fn set_mute(&self, mute: bool) -> Result<()> {
        self.registry.with_session(&self.key, true, |s| {
            s.volume.muted = mute;
            Ok(())
        })?;
        log::debug!("Session {} mute = {}", self.key.id, mute);
        Ok(())
    }

    pub fn mute(&self) -> bool {
        self.registry
            .with_session(&self.key, false, |s| Ok(s.volume.muted))
            .unwrap_or(false)
    }

    pub fn channel_count(&self) -> usize {
        self.registry
            .with_session(&self.key, false, |s| Ok(s.volume.channel_vols.len()))
            .unwrap_or(0)
    }

    pub fn set_channel_volume(&self, index: usize, level: f32) -> Result<()> {
        check_level(level)?;
        self.registry.with_session(&self.key, true, |s| {
            let slot = s
                .volume
                .channel_vols
                .get_mut(index)
                .ok_or(StreamError::InvalidArgument("channel index"))?;
            *slot = level;
            Ok(())
        })
    }

    pub fn channel_volume(&self, index: usize) -> Result<f32> {
        self.registry.with_session(&self.key, false, |s| {
            s.volume
                .channel_vols
                .get(index)
                .copied()
                .ok_or(StreamError::InvalidArgument("channel index"))
        })
    }

    pub fn set_all_volumes(&self, levels: &[f32]) -> Result<()> {
        for &level in levels {
            check_level(level)?;
        }
        self.registry.with_session(&self.key, true, |s| {
            if levels.len() != s.volume.channel_vols.len() {
                return Err(StreamError::InvalidArgument("channel count"));
            }
            s.volume.channel_vols.copy_from_slice(levels);
            Ok(())
        })
    }

    pub fn all_volumes(&self) -> Vec<f32> {
        self.registry
            .with_session(&self.key, false, |s| Ok(s.volume.channel_vols.clone()))
            .unwrap_or_default()
    }

    pub fn state(&self) -> SessionState {
        self.registry
            .with_session(&self.key, false, |s| Ok(s.state()))
            .unwrap_or(SessionState::Expired)
    }
}

impl std::fmt::Debug for SessionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionControl").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u128) -> SessionKey {
        SessionKey::new(SessionId(id), "default")
    }

    #[test]
    fn test_control_creates_session() {
        let registry = Arc::new(SessionRegistry::new());
        let control = registry.control(key(1));
        assert_eq!(registry.len(), 1);
        assert_eq!(control.channel_count(), 0);
        assert_eq!(control.master_volume(), 1.0);
        assert!(!control.mute());
        assert_eq!(control.state(), SessionState::Expired);

        // 同一个键返回同一个 session
        registry.control(key(1)).set_master_volume(0.25).unwrap();
        assert_eq!(control.master_volume(), 0.25);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_level_validation() {
        let registry = Arc::new(SessionRegistry::new());
        let control = registry.control(key(1));
        assert!(matches!(
            control.set_master_volume(1.5),
            Err(StreamError::InvalidArgument(_))
        ));
        assert!(control.set_master_volume(f32::NAN).is_err());
        assert!(matches!(
            control.set_channel_volume(0, 0.5),
            Err(StreamError::InvalidArgument("channel index"))
        ));
        assert!(control.set_all_volumes(&[]).is_ok());
        assert!(control.set_all_volumes(&[1.0]).is_err());
    }

    #[test]
    fn test_prune_expired() {
        let registry = Arc::new(SessionRegistry::new());
        registry.control(key(1));
        registry.control(key(2));
        assert_eq!(registry.prune_expired(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_session_id_display() {
        let id = SessionId(0x0123_4567_89ab_cdef_0011_2233_4455_6677);
        assert_eq!(id.to_string(), "01234567-89ab-cdef-0011-223344556677");
        assert_ne!(SessionId::random(), SessionId::random());
    }
}
