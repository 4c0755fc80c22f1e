//! 保活监控
//!
//! 两个独立的计时面：
//! - 发送侧：包装出站消息队列的装饰器，应用消息静默超过保活间隔时注入
//!   一帧预编码的 Ping；任何真实消息发出都会重置计时
//! - 接收侧：记录最近一次收到消息的时刻，静默超过超时阈值即判定对端失联；
//!   任何成功解析的帧（不只是 Ping）都会重置计时

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// 出站队列的保活装饰器
///
/// `recv()` 把真实队列的等待与保活计时器竞速：计时器先到就合成一帧 Ping
/// 立即返回；`try_recv()` 先排空挂起的 Ping 再查询真实队列
pub struct KeepAliveMonitor {
    inner: mpsc::Receiver<Bytes>,
    interval: Duration,
    ping: Bytes,
    deadline: Instant,
    pending_ping: bool,
    enabled: bool,
}

impl KeepAliveMonitor {
    /// 创建保活装饰器
    ///
    /// `ping` 是按当前协议预编码好的 Ping 帧；`enabled` 为 false 时
    /// （例如传输自身具备保活）退化为对真实队列的透明转发
    pub fn new(
        inner: mpsc::Receiver<Bytes>,
        interval: Duration,
        ping: Bytes,
        enabled: bool,
    ) -> Self {
        Self {
            inner,
            interval,
            ping,
            deadline: Instant::now() + interval,
            pending_ping: false,
            enabled,
        }
    }

    /// 等待下一帧出站数据；保活计时先到期则返回 Ping 帧
    ///
    /// 返回 `None` 表示出站队列已经关闭（连接正在拆除）
    pub async fn recv(&mut self) -> Option<Bytes> {
        if self.pending_ping {
            self.pending_ping = false;
            self.arm();
            return Some(self.ping.clone());
        }

        if !self.enabled {
            return self.inner.recv().await;
        }

        tokio::select! {
            message = self.inner.recv() => {
                self.arm();
                message
            }
            _ = tokio::time::sleep_until(self.deadline) => {
                self.arm();
                Some(self.ping.clone())
            }
        }
    }

    /// 非阻塞读取：先排空挂起的 Ping，再查询真实队列
    pub fn try_recv(&mut self) -> Option<Bytes> {
        if self.enabled && Instant::now() >= self.deadline {
            self.pending_ping = true;
        }
        if self.pending_ping {
            self.pending_ping = false;
            self.arm();
            return Some(self.ping.clone());
        }
        match self.inner.try_recv() {
            Ok(message) => {
                self.arm();
                Some(message)
            }
            Err(_) => None,
        }
    }

    fn arm(&mut self) {
        self.deadline = Instant::now() + self.interval;
    }
}

/// 接收侧静默计时
#[derive(Debug)]
pub struct ReceiveClock {
    last: Instant,
    timeout: Duration,
}

impl ReceiveClock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last: Instant::now(),
            timeout,
        }
    }

    /// 收到任意帧时重置计时
    pub fn touch(&mut self) {
        self.last = Instant::now();
    }

    /// 静默超时的截止时刻
    pub fn deadline(&self) -> Instant {
        self.last + self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping() -> Bytes {
        Bytes::from_static(b"{\"type\":6}\x1e")
    }

    /// 测试：静默超过保活间隔时注入 Ping
    #[tokio::test(start_paused = true)]
    async fn test_idle_injects_ping() {
        let (_tx, rx) = mpsc::channel(4);
        let mut monitor = KeepAliveMonitor::new(rx, Duration::from_secs(15), ping(), true);

        let frame = monitor.recv().await.expect("ping injected");
        assert_eq!(frame, ping());
    }

    /// 测试：真实消息优先于 Ping 且重置计时
    #[tokio::test(start_paused = true)]
    async fn test_real_message_resets_timer() {
        let (tx, rx) = mpsc::channel(4);
        let mut monitor = KeepAliveMonitor::new(rx, Duration::from_secs(15), ping(), true);

        tx.send(Bytes::from_static(b"payload")).await.expect("send");
        let frame = monitor.recv().await.expect("message");
        assert_eq!(frame, Bytes::from_static(b"payload"));

        // 下一帧要等满一个完整间隔才是 Ping
        tokio::time::advance(Duration::from_secs(14)).await;
        assert!(monitor.try_recv().is_none());
        let frame = monitor.recv().await.expect("ping");
        assert_eq!(frame, ping());
    }

    /// 测试：禁用时退化为透明转发，不注入 Ping
    #[tokio::test(start_paused = true)]
    async fn test_disabled_monitor_never_pings() {
        let (tx, rx) = mpsc::channel(4);
        let mut monitor = KeepAliveMonitor::new(rx, Duration::from_secs(1), ping(), false);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(monitor.try_recv().is_none());

        tx.send(Bytes::from_static(b"data")).await.expect("send");
        assert_eq!(monitor.recv().await, Some(Bytes::from_static(b"data")));
    }

    /// 测试：接收计时在 touch 后推迟截止时刻
    #[tokio::test(start_paused = true)]
    async fn test_receive_clock_touch() {
        let mut clock = ReceiveClock::new(Duration::from_secs(30));
        let first_deadline = clock.deadline();

        tokio::time::advance(Duration::from_secs(10)).await;
        clock.touch();
        assert!(clock.deadline() > first_deadline);
    }
}
