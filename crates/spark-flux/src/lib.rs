#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-flux: 基于需求背压的最小响应式流执行内核。"]
#![doc = ""]
#![doc = "== 组成 =="]
#![doc = "1. `protocol`：request/cancel/emit 需求协议与串行排空原语，所有上层组件共用同一份契约。"]
#![doc = "2. `flux`：`Flux<T>` 组合类型、源、算子、调度切换点与终端订阅。"]
#![doc = "3. `scheduler`：立即执行、单线程、并行与有界弹性四类调度器。"]
#![doc = "4. `retry`：重试策略与退避计算，失败后重新订阅上游并继承下游需求。"]
#![doc = "5. `sink`：单播、多播、缓冲多播与回放汇点，发射结果以值返回。"]
#![doc = "6. `context`：订阅期不可变上下文与跨线程环境状态快照。"]
#![doc = ""]
#![doc = "== 执行模型 =="]
#![doc = "未配置调度切换点时，整条链在订阅线程上同步执行；`publish_on`/`subscribe_on` 把信号投递或订阅动作"]
#![doc = "转移到调度器的工作线程上。除阻塞桥接（`block_*`/`collect_blocking*`）之外，任何阶段都不会阻塞调用线程。"]
#![doc = ""]
#![doc = "```"]
#![doc = "use spark_flux::flux::Flux;"]
#![doc = ""]
#![doc = "let evens = Flux::range(1, 10)"]
#![doc = "    .filter(|value| value % 2 == 0)"]
#![doc = "    .map(|value| value * 10)"]
#![doc = "    .collect_blocking()"]
#![doc = "    .unwrap();"]
#![doc = "assert_eq!(evens, vec![20, 40, 60, 80, 100]);"]
#![doc = "```"]

pub mod config;
pub mod context;
pub mod error;
pub mod flux;
pub mod hooks;
pub mod protocol;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod testing;

pub use error::{ConfigError, EmitError, FlowError, SchedulerError};
pub use flux::{Disposable, Flux};
