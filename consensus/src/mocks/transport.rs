use crate::gossip::Message;
use commonware_cryptography::ed25519::PublicKey;
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::{future::Future, sync::Arc};

/// A message posted through a [Transport].
#[derive(Clone, Debug)]
pub struct Post {
    pub from: PublicKey,
    pub to: PublicKey,
    pub message: Message,
    pub correlation: u64,
}

/// Transport that records every post and, if connected, forwards it to a router.
///
/// Clones share the same record.
#[derive(Clone)]
pub struct Transport {
    me: PublicKey,
    sent: Arc<Mutex<Vec<Post>>>,
    router: Option<mpsc::UnboundedSender<Post>>,
}

impl Transport {
    /// Creates a transport that only records posts.
    pub fn new(me: PublicKey) -> Self {
        Self {
            me,
            sent: Arc::new(Mutex::new(Vec::new())),
            router: None,
        }
    }

    /// Creates a transport that also forwards posts to `router`.
    pub fn connected(me: PublicKey, router: mpsc::UnboundedSender<Post>) -> Self {
        Self {
            router: Some(router),
            ..Self::new(me)
        }
    }

    /// Returns every post made so far.
    pub fn sent(&self) -> Vec<Post> {
        self.sent.lock().clone()
    }
}

impl crate::gossip::Transport for Transport {
    fn post(
        &self,
        peer: PublicKey,
        message: Message,
        correlation: u64,
    ) -> impl Future<Output = ()> + Send {
        let post = Post {
            from: self.me.clone(),
            to: peer,
            message,
            correlation,
        };
        self.sent.lock().push(post.clone());
        if let Some(router) = &self.router {
            // The router may have shut down at the end of a test.
            let _ = router.unbounded_send(post);
        }
        async {}
    }
}
