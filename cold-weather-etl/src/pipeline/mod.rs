use std::{pin::Pin, sync::Arc, time::SystemTime};

use futures::{Stream, StreamExt};

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }

    /// Replace the payload, keeping the receive time.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            payload: f(self.payload),
            received_at: self.received_at,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("transform error: {0}")]
    Transform(String),
    #[error("sink error: {0}")]
    Sink(String),
    #[error("schema error: {0}")]
    Schema(String),
}

pub type EnvelopeStream<T> = Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> EnvelopeStream<T>;
}

#[async_trait::async_trait]
pub trait Transform<I, O>: Send + Sync {
    async fn apply(&self, input: Envelope<I>) -> Result<Envelope<O>, PipelineError>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    type Report: Send;

    async fn run<S>(&self, input: S) -> Result<Self::Report, PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

pub struct Pipeline<S, I, O, K> {
    pub source: S,
    pub transform: Arc<dyn Transform<I, O> + Send + Sync>,
    pub sink: K,
}

impl<S, I, O, K> Pipeline<S, I, O, K>
where
    I: Send + 'static,
    O: Send + 'static,
    S: Source<I> + Send + Sync + 'static,
    K: Sink<O> + Send + Sync + 'static,
{
    pub async fn run(self) -> Result<K::Report, PipelineError> {
        let transform = self.transform;
        let stream = self.source.stream().await.then(move |item| {
            let t = transform.clone();
            async move {
                match item {
                    Ok(env) => t.apply(env).await,
                    Err(e) => Err(e),
                }
            }
        });

        self.sink.run(Box::pin(stream)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    struct Numbers(Vec<Result<i32, &'static str>>);

    #[async_trait::async_trait]
    impl Source<i32> for Numbers {
        async fn stream(&self) -> EnvelopeStream<i32> {
            let items: Vec<_> = self
                .0
                .iter()
                .copied()
                .map(|r| {
                    r.map(Envelope::now)
                        .map_err(|e| PipelineError::Source(e.to_string()))
                })
                .collect();
            Box::pin(stream::iter(items))
        }
    }

    struct Double;

    #[async_trait::async_trait]
    impl Transform<i32, i64> for Double {
        async fn apply(&self, input: Envelope<i32>) -> Result<Envelope<i64>, PipelineError> {
            Ok(input.map(|v| i64::from(v) * 2))
        }
    }

    struct Collect;

    #[async_trait::async_trait]
    impl Sink<i64> for Collect {
        type Report = Vec<i64>;

        async fn run<S>(&self, mut input: S) -> Result<Vec<i64>, PipelineError>
        where
            S: Stream<Item = Result<Envelope<i64>, PipelineError>> + Send + Unpin + 'static,
        {
            let mut out = Vec::new();
            while let Some(item) = input.next().await {
                out.push(item?.payload);
            }
            Ok(out)
        }
    }

    #[tokio::test]
    async fn transforms_in_order_and_reports() {
        let pipeline: Pipeline<_, i32, i64, _> = Pipeline {
            source: Numbers(vec![Ok(1), Ok(2), Ok(3)]),
            transform: Arc::new(Double),
            sink: Collect,
        };

        assert_eq!(pipeline.run().await.unwrap(), vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn source_errors_reach_the_sink() {
        let pipeline: Pipeline<_, i32, i64, _> = Pipeline {
            source: Numbers(vec![Ok(1), Err("boom")]),
            transform: Arc::new(Double),
            sink: Collect,
        };

        assert!(matches!(pipeline.run().await, Err(PipelineError::Source(_))));
    }
}
