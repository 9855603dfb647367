//! Example: invalidating every page of a list after a remote write.
//!
//! Two consumers observe two pages of a todo list. Posting a new todo goes
//! through a remote mutation; afterwards every cached `/todos` key is patched
//! locally and revalidated in one pass.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use swr_store::{
    MatchRevalidateOptions, MutateOptions, MutationFetcher, Payload, SwrClient, SwrOptions,
    fetcher_fn, prefix,
};
use tokio::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Todo {
    id: u64,
    title: String,
}

type Page = Vec<Todo>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The "server": a shared list, two todos per page
    let server: Arc<Mutex<Vec<Todo>>> = Arc::new(Mutex::new(
        (1..=3)
            .map(|id| Todo {
                id,
                title: format!("todo #{id}"),
            })
            .collect(),
    ));

    let list = Arc::clone(&server);
    let client = SwrClient::<Page, String>::builder()
        .lru(100)
        .fetcher(fetcher_fn(move |key: String, _ctx| {
            let list = Arc::clone(&list);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let page = key.rsplit('=').next().and_then(|page| page.parse::<usize>().ok());
                let page = match page {
                    Some(page) if page > 0 => page,
                    _ => return Err(format!("bad key {key}")),
                };
                let list = list.lock().await;
                Ok(list.iter().skip((page - 1) * 2).take(2).cloned().collect::<Page>())
            }
        }))
        .on_success_deduped(|key, page: &Page| println!("fetched {key}: {} todos", page.len()))
        .build()?;

    let first = client.use_swr(Some("/todos?page=1"), SwrOptions::new())?;
    let second = client.use_swr(Some("/todos?page=2"), SwrOptions::new())?;
    first.suspend().await.ok();
    second.suspend().await.ok();
    println!("page 1: {:?}", first.state().data);
    println!("page 2: {:?}", second.state().data);

    // Post a new todo
    let posted = Arc::clone(&server);
    let send: MutationFetcher<String, Todo, String> = Arc::new(move |title: String| {
        let posted = Arc::clone(&posted);
        async move {
            let mut list = posted.lock().await;
            let todo = Todo {
                id: list.len() as u64 + 1,
                title,
            };
            list.push(todo.clone());
            Ok(todo)
        }
        .boxed()
    });
    let add_todo = client.mutation(prefix("/todos"), send);
    let todo = add_todo.trigger("write the docs".to_string()).await?;

    // Optimistically tag every page, then pull the real state
    let tagged = client
        .match_mutate(
            prefix("/todos"),
            Payload::produce(|page: &mut Page| {
                for todo in page.iter_mut() {
                    todo.title.push_str(" (stale)");
                }
            }),
            MutateOptions::default(),
        )
        .await?;
    println!("tagged {} pages after posting #{}", tagged.len(), todo.id);
    println!("page 2 now: {:?}", second.state().data);

    let outcomes = client
        .match_revalidate(prefix("/todos"), MatchRevalidateOptions::default())
        .await?;
    for (key, outcome) in outcomes {
        println!("{key}: fetched={}", outcome.is_fetched());
    }
    println!("page 2 after revalidation: {:?}", second.state().data);

    Ok(())
}
