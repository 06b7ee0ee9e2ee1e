use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use resources::objects::{gpa::GeneralPodAutoscaler, Object};
use tokio::sync::{mpsc, RwLock};

use crate::utils::AutoscalerClient;

pub type Store<T> = Arc<RwLock<HashMap<String, T>>>;

#[derive(Debug)]
pub enum Event<T> {
    Add(T),
    /// old value, new value
    Update(T, T),
    Delete(T),
}

/// Keeps a local copy of all autoscalers by relisting them periodically,
/// and reports what changed between two lists.
pub struct Informer {
    client: Arc<dyn AutoscalerClient>,
    store: Store<GeneralPodAutoscaler>,
    period: Duration,
}

impl Informer {
    pub fn new(client: Arc<dyn AutoscalerClient>, period: Duration) -> Self {
        Self {
            client,
            store: Arc::new(RwLock::new(HashMap::new())),
            period,
        }
    }

    pub fn get_store(&self) -> Store<GeneralPodAutoscaler> {
        self.store.clone()
    }

    /// Relist forever. Returns once the receiving end is gone.
    pub async fn run(&self, tx: mpsc::Sender<Event<GeneralPodAutoscaler>>) -> Result<()> {
        tracing::info!("Informer started");
        let mut interval = tokio::time::interval(self.period);
        loop {
            interval.tick().await;
            if let Err(e) = self.list(&tx).await {
                if tx.is_closed() {
                    return Ok(());
                }
                tracing::warn!("List failed, caused by: {:#}", e);
            }
        }
    }

    async fn list(&self, tx: &mpsc::Sender<Event<GeneralPodAutoscaler>>) -> Result<()> {
        let objects = self.client.list_autoscalers().await?;
        let events = self.replace(objects).await;
        for event in events {
            tx.send(event).await?;
        }
        Ok(())
    }

    /// Swap the store content for `objects`, returning the differences.
    async fn replace(&self, objects: Vec<GeneralPodAutoscaler>) -> Vec<Event<GeneralPodAutoscaler>> {
        let mut new_store = objects
            .into_iter()
            .map(|object| (object.key(), object))
            .collect::<HashMap<_, _>>();
        let mut store = self.store.write().await;
        let mut events = Vec::new();
        for (key, new) in &new_store {
            match store.get(key) {
                None => events.push(Event::Add(new.clone())),
                Some(old) if old != new => events.push(Event::Update(old.clone(), new.clone())),
                Some(_) => tracing::debug!("Object {} is already up to date", key),
            }
        }
        for (key, old) in store.drain() {
            if !new_store.contains_key(&key) {
                events.push(Event::Delete(old));
            }
        }
        std::mem::swap(&mut *store, &mut new_store);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeAutoscalers;

    fn autoscaler(name: &str, max_replicas: u32) -> GeneralPodAutoscaler {
        serde_yaml::from_str(&format!(
            "metadata:\n  name: {}\nspec:\n  maxReplicas: {}\n  scaleTargetRef:\n    kind: Deployment\n    name: web\n",
            name, max_replicas
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn list_diffs_against_store() {
        let client = Arc::new(FakeAutoscalers::default());
        *client.objects.lock() = vec![autoscaler("a", 5), autoscaler("b", 5)];
        let informer = Informer::new(client.clone(), Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(16);

        informer.list(&tx).await.unwrap();
        let mut added = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()]
            .into_iter()
            .map(|event| match event {
                Event::Add(gpa) => gpa.key(),
                other => panic!("unexpected event {:?}", other),
            })
            .collect::<Vec<_>>();
        added.sort();
        assert_eq!(added, ["default/a", "default/b"]);

        // Unchanged objects produce nothing
        informer.list(&tx).await.unwrap();
        assert!(rx.try_recv().is_err());

        *client.objects.lock() = vec![autoscaler("a", 8)];
        informer.list(&tx).await.unwrap();
        let mut events = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        events.sort_by_key(|event| matches!(event, Event::Delete(_)));
        match &events[0] {
            Event::Update(old, new) => {
                assert_eq!(old.spec.max_replicas, 5);
                assert_eq!(new.spec.max_replicas, 8);
            },
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(&events[1], Event::Delete(gpa) if gpa.key() == "default/b"));

        let store = informer.get_store();
        let store = store.read().await;
        assert_eq!(store.len(), 1);
        assert_eq!(store["default/a"].spec.max_replicas, 8);
    }
}
