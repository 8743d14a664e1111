use crate::broker::Message;
use std::future::Future;

/// Implementers of the `MessageListener` trait process the messages received by a
/// [`ListenerContainer`](super::ListenerContainer).
///
/// `on_message` does not get access to the underlying session: the container takes care of
/// acknowledging or rolling back the message according to the outcome of processing. In a
/// transacted container an `Err` puts the message back on its destination for redelivery; in a
/// non-transacted one the error is logged and the message is gone.
///
/// While you can implement `MessageListener` for a struct or enum, most of the time you will
/// wrap an async function with a matching signature in a [`ClosureListener`].
#[async_trait::async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn on_message(&self, message: Message) -> Result<(), anyhow::Error>;
}

/// Wrapper type to turn an async closure into a [`MessageListener`].
///
/// ```rust
/// use carrot_harness::broker::Message;
/// use carrot_harness::listener::ClosureListener;
///
/// let listener = ClosureListener(|message: Message| async move {
///     println!("{}", message.text());
///     Ok::<_, anyhow::Error>(())
/// });
/// ```
pub struct ClosureListener<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> MessageListener for ClosureListener<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
{
    async fn on_message(&self, message: Message) -> Result<(), anyhow::Error> {
        (self.0)(message).await
    }
}
