//! 单元测试用的模拟后端
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// 按脚本回复的 UDP 后端，记录收到的每个请求
pub(crate) struct FakeBackend {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    task: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn spawn<F>(respond: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        Self::spawn_with_delay(Duration::ZERO, respond).await
    }

    /// 每次回复前等待 `delay`
    pub async fn spawn_with_delay<F>(delay: Duration, respond: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                    continue;
                };
                let request = buf[..len].to_vec();
                recorded.lock().unwrap().push(request.clone());

                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                for reply in respond(&request) {
                    let _ = socket.send_to(&reply, src).await;
                }
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}
