//! Pure text stages: admission filtering and sampling on the way into the
//! queue, templating and normalization on the way out.

pub mod filter;
pub mod normalize;
pub mod template;

pub use filter::{admit, sample, CompiledRule, FilterRule};
pub use normalize::Normalizer;
pub use template::apply_template;

use crate::task::Task;

/// Final outgoing content for a task: template first, then normalize.
pub fn render(task: &Task, normalizer: &Normalizer) -> String {
    let templated = apply_template(
        &task.text,
        &task.template,
        &[
            ("channel_name", task.display_name.as_str()),
            ("display_name", task.display_name.as_str()),
        ],
    );
    normalizer.normalize(&templated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NormalizeConfig;
    use crate::task::Template;

    #[test]
    fn test_render_templates_then_normalizes() {
        let normalizer = Normalizer::new(&NormalizeConfig::default()).unwrap();
        let task = Task {
            source_id: -100,
            message_id: 42,
            text: "夸克：https://pan.quark.cn/s/abc123\n来自：某频道".to_string(),
            media_path: None,
            target_channel_id: None,
            template: Template {
                prefix: "[{{channel_name}}]\n".to_string(),
                suffix: String::new(),
            },
            display_name: "影视".to_string(),
        };
        assert_eq!(
            render(&task, &normalizer),
            "[影视]\n网盘资源链接：www.zhuiju.us 访问搜影片名或进QQ群搜索"
        );
    }
}
