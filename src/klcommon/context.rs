use crate::klcommon::error::{AppError, Result};
use tokio::task::JoinHandle;
use tracing::Span;

/// 派生一个继承了当前上下文的阻塞任务。
///
/// 阻塞任务在不同的线程上运行，因此必须使用 `in_scope` 来恢复上下文。
pub fn spawn_blocking_instrumented<F, R>(f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let parent_span = Span::current();
    tokio::task::spawn_blocking(move || parent_span.in_scope(f))
}

/// 在阻塞线程池上执行 SQLite 读写、解压和CSV解析，避免占用异步工作线程
pub async fn run_blocking<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    match spawn_blocking_instrumented(f).await {
        Ok(result) => result,
        Err(join_error) => {
            let task_error = AppError::TaskError(format!("阻塞任务异常退出: {:?}", join_error));
            tracing::error!(
                message = "阻塞任务异常退出",
                error.summary = task_error.get_error_type_summary(),
                error.details = %task_error
            );
            Err(task_error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_closure_result() {
        assert_eq!(run_blocking(|| Ok(7)).await.unwrap(), 7);
        let err = run_blocking::<_, ()>(|| Err(AppError::DatabaseError("locked".into()))).await.unwrap_err();
        assert!(err.is_storage());
    }

    #[tokio::test]
    async fn panic_becomes_task_error() {
        let err = run_blocking::<_, ()>(|| panic!("boom")).await.unwrap_err();
        assert!(matches!(err, AppError::TaskError(_)));
    }
}
