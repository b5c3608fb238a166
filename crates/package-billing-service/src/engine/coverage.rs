//! 套餐覆盖判断与候选查找
//!
//! 覆盖规则：
//! - 套餐绑定了具体服务时，只覆盖该服务
//! - 未绑定服务的储值套餐覆盖所有服务
//! - 未绑定服务的赠送/折扣套餐按模板服务列表判断
//! - 未绑定服务的无限次套餐仅当模板为会员类且服务列表包含该服务时覆盖，
//!   不存在"覆盖一切"的无限次套餐

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{BenefitKind, PackageGrant, PackageTemplate};

/// 判断套餐是否覆盖指定服务
///
/// `template` 缺失时，依赖模板服务列表的类型一律视为不覆盖
pub fn covers_service(
    grant: &PackageGrant,
    template: Option<&PackageTemplate>,
    service_id: i64,
) -> bool {
    if let Some(bound) = grant.service_id {
        return bound == service_id;
    }

    match grant.kind() {
        BenefitKind::Prepaid => true,
        BenefitKind::Free | BenefitKind::Discount => {
            template.is_some_and(|t| t.lists_service(service_id))
        }
        BenefitKind::Unlimited => {
            template.is_some_and(|t| t.is_membership && t.lists_service(service_id))
        }
    }
}

/// 查找客户在指定时间点可用于该服务的套餐
///
/// 返回结果未排序，排序交给优先级解析
pub fn locate<'a>(
    customer_id: i64,
    grants: &'a [PackageGrant],
    templates: &HashMap<i64, PackageTemplate>,
    service_id: i64,
    as_of: DateTime<Utc>,
) -> Vec<&'a PackageGrant> {
    grants
        .iter()
        .filter(|g| g.customer_id == customer_id)
        .filter(|g| g.is_available(as_of))
        .filter(|g| covers_service(g, templates.get(&g.template_id), service_id))
        .collect()
}
